//! Write coordinator.
//!
//! Sends create/update/delete/batch-create to the store(s) the phase calls
//! for. In `dual_write` and `dual_read` the legacy write always runs first;
//! the target write only starts once legacy has succeeded and reuses the
//! entity legacy returned (and therefore its id). Target failures are logged
//! and counted but never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::MigrationError;
use super::metrics::{MetricsEmitter, Operation, SECONDARY_WRITE_FAILURE};
use super::phase::MigrationPhase;
use crate::store::{Entity, EntityStore, SharedStore, StoreError};

/// How the target leg of a dual write is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryWriteMode {
    /// The caller waits for the target write (its outcome is still ignored).
    /// A caller that is cancelled meanwhile leaves the write running.
    #[default]
    Await,
    /// The target write is spawned and the caller returns right after legacy.
    Detached,
}

/// Limits applied to every secondary (target) leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecondaryPolicy {
    /// Upper bound on a secondary read or write; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub write_mode: SecondaryWriteMode,
}

/// A target write waiting to be mirrored.
enum SecondaryWrite<E> {
    Create(E),
    Update(E),
    Delete(String),
    BatchCreate(Vec<E>),
}

impl<E: Entity> SecondaryWrite<E> {
    fn operation(&self) -> Operation {
        match self {
            Self::Create(_) => Operation::Create,
            Self::Update(_) => Operation::Update,
            Self::Delete(_) => Operation::Delete,
            Self::BatchCreate(_) => Operation::BatchCreate,
        }
    }

    /// Identifying fields for the failure log.
    fn describe(&self) -> String {
        let one = |entity: &E| {
            format!(
                "id={} natural_key={}",
                entity.id().unwrap_or("-"),
                entity.natural_key()
            )
        };
        match self {
            Self::Create(entity) | Self::Update(entity) => one(entity),
            Self::Delete(id) => format!("id={id}"),
            Self::BatchCreate(entities) => {
                let ids: Vec<&str> = entities.iter().filter_map(|e| e.id()).collect();
                format!("count={} ids=[{}]", entities.len(), ids.join(","))
            }
        }
    }

    async fn apply(self, target: &dyn EntityStore<E>) -> Result<(), StoreError> {
        match self {
            Self::Create(entity) => target.create(entity).await.map(|_| ()),
            Self::Update(entity) => target.update(entity).await.map(|_| ()),
            Self::Delete(id) => match target.delete(&id).await {
                // The target never had it, which is the state we wanted.
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            },
            Self::BatchCreate(entities) => target.batch_create(entities).await.map(|_| ()),
        }
    }
}

/// Routes writes to the legacy and/or target store by phase.
pub struct WriteCoordinator<E: Entity> {
    legacy: SharedStore<E>,
    target: SharedStore<E>,
    policy: SecondaryPolicy,
    metrics: MetricsEmitter,
}

impl<E: Entity> WriteCoordinator<E> {
    pub fn new(
        legacy: SharedStore<E>,
        target: SharedStore<E>,
        policy: SecondaryPolicy,
        metrics: MetricsEmitter,
    ) -> Self {
        Self {
            legacy,
            target,
            policy,
            metrics,
        }
    }

    pub async fn create(&self, phase: MigrationPhase, entity: E) -> Result<E, MigrationError> {
        match phase {
            MigrationPhase::Legacy => Ok(self.legacy.create(entity).await?),
            MigrationPhase::Target => Ok(self.target.create(entity).await?),
            MigrationPhase::DualWrite | MigrationPhase::DualRead => {
                let created = self.legacy.create(entity).await?;
                self.mirror(phase, SecondaryWrite::Create(created.clone()))
                    .await;
                Ok(created)
            }
        }
    }

    pub async fn update(&self, phase: MigrationPhase, entity: E) -> Result<E, MigrationError> {
        match phase {
            MigrationPhase::Legacy => Ok(self.legacy.update(entity).await?),
            MigrationPhase::Target => Ok(self.target.update(entity).await?),
            MigrationPhase::DualWrite | MigrationPhase::DualRead => {
                let updated = self.legacy.update(entity).await?;
                self.mirror(phase, SecondaryWrite::Update(updated.clone()))
                    .await;
                Ok(updated)
            }
        }
    }

    pub async fn delete(&self, phase: MigrationPhase, id: &str) -> Result<(), MigrationError> {
        match phase {
            MigrationPhase::Legacy => Ok(self.legacy.delete(id).await?),
            MigrationPhase::Target => Ok(self.target.delete(id).await?),
            MigrationPhase::DualWrite | MigrationPhase::DualRead => {
                self.legacy.delete(id).await?;
                self.mirror(phase, SecondaryWrite::Delete(id.to_string()))
                    .await;
                Ok(())
            }
        }
    }

    /// All items go to legacy first; the target sees the batch only when
    /// the whole legacy batch succeeded.
    pub async fn batch_create(
        &self,
        phase: MigrationPhase,
        entities: Vec<E>,
    ) -> Result<Vec<E>, MigrationError> {
        match phase {
            MigrationPhase::Legacy => Ok(self.legacy.batch_create(entities).await?),
            MigrationPhase::Target => Ok(self.target.batch_create(entities).await?),
            MigrationPhase::DualWrite | MigrationPhase::DualRead => {
                let created = self.legacy.batch_create(entities).await?;
                if !created.is_empty() {
                    self.mirror(phase, SecondaryWrite::BatchCreate(created.clone()))
                        .await;
                }
                Ok(created)
            }
        }
    }

    /// Run the target leg on its own task. Never fails: errors and timeouts
    /// are logged and counted as secondary write failures.
    async fn mirror(&self, phase: MigrationPhase, write: SecondaryWrite<E>) {
        let target = Arc::clone(&self.target);
        let metrics = self.metrics.clone();
        let timeout = self.policy.timeout;

        let leg = async move {
            let operation = write.operation();
            let described = write.describe();
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, write.apply(target.as_ref()))
                    .await
                    .unwrap_or_else(|_| {
                        Err(StoreError::Unavailable(format!(
                            "{} did not answer within {}ms",
                            target.name(),
                            limit.as_millis()
                        )))
                    }),
                None => write.apply(target.as_ref()).await,
            };

            if let Err(err) = result {
                log::error!(
                    "SecondaryWriteFailure: operation={} entity={} {} phase={} store={} error={}",
                    operation,
                    E::KIND,
                    described,
                    phase,
                    target.name(),
                    err
                );
                metrics.count(SECONDARY_WRITE_FAILURE, operation);
            }
        };

        // Spawned in both modes so a cancelled caller cannot drop the leg.
        let handle = tokio::spawn(leg);
        if self.policy.write_mode == SecondaryWriteMode::Await {
            if let Err(err) = handle.await {
                log::error!(
                    "SecondaryWriteFailure: entity={} phase={} task aborted: {}",
                    E::KIND,
                    phase,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskState;
    use crate::migration::metrics::InMemoryMetrics;
    use crate::store::testing::{RecordingStore, StoreCall};
    use serde_json::json;

    struct Fixture {
        legacy: Arc<RecordingStore<TaskState>>,
        target: Arc<RecordingStore<TaskState>>,
        metrics: Arc<InMemoryMetrics>,
        writer: WriteCoordinator<TaskState>,
    }

    fn fixture_with(
        legacy: RecordingStore<TaskState>,
        target: RecordingStore<TaskState>,
        policy: SecondaryPolicy,
    ) -> Fixture {
        let legacy = Arc::new(legacy);
        let target = Arc::new(target);
        let metrics = Arc::new(InMemoryMetrics::new());
        let writer = WriteCoordinator::new(
            legacy.clone(),
            target.clone(),
            policy,
            MetricsEmitter::new(metrics.clone(), TaskState::KIND),
        );
        Fixture {
            legacy,
            target,
            metrics,
            writer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            RecordingStore::new("legacy"),
            RecordingStore::new("target"),
            SecondaryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_single_store_phases_touch_one_store() {
        let f = fixture();
        f.writer
            .create(MigrationPhase::Legacy, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();
        assert_eq!(f.legacy.calls().len(), 1);
        assert!(f.target.calls().is_empty());

        f.writer
            .create(MigrationPhase::Target, TaskState::new("t2", "a1", json!({})))
            .await
            .unwrap();
        assert_eq!(f.legacy.calls().len(), 1);
        assert_eq!(f.target.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dual_write_reuses_legacy_id() {
        let f = fixture();
        let created = f
            .writer
            .create(MigrationPhase::DualWrite, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();
        let id = created.id.clone().unwrap();

        assert_eq!(f.legacy.calls(), vec![StoreCall::Create(None)]);
        assert_eq!(f.target.calls(), vec![StoreCall::Create(Some(id.clone()))]);
        assert!(f.target.memory().get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_target_failure_is_isolated() {
        let f = fixture_with(
            RecordingStore::new("legacy"),
            RecordingStore::new("target").failing_writes(),
            SecondaryPolicy::default(),
        );

        let created = f
            .writer
            .create(MigrationPhase::DualRead, TaskState::new("t1", "a1", json!({"n": 1})))
            .await
            .expect("target failure must not fail the write");
        assert_eq!(created.state, json!({"n": 1}));
        assert_eq!(f.metrics.count(SECONDARY_WRITE_FAILURE), 1);
        assert_eq!(
            f.metrics
                .count_tagged(SECONDARY_WRITE_FAILURE, "operation", "create"),
            1
        );
    }

    #[tokio::test]
    async fn test_legacy_failure_skips_target() {
        let f = fixture_with(
            RecordingStore::new("legacy").failing_writes(),
            RecordingStore::new("target"),
            SecondaryPolicy::default(),
        );

        let err = f
            .writer
            .create(MigrationPhase::DualWrite, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Store(StoreError::Unavailable(_))));
        assert!(f.target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_mirror_in_order() {
        let f = fixture();
        let mut created = f
            .writer
            .create(MigrationPhase::DualWrite, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();
        let id = created.id.clone().unwrap();
        f.legacy.clear_calls();
        f.target.clear_calls();

        created.state = json!({"done": true});
        f.writer
            .update(MigrationPhase::DualWrite, created)
            .await
            .unwrap();
        f.writer.delete(MigrationPhase::DualWrite, &id).await.unwrap();

        let expected = vec![StoreCall::Update(id.clone()), StoreCall::Delete(id.clone())];
        assert_eq!(f.legacy.calls(), expected);
        assert_eq!(f.target.calls(), expected);
        assert_eq!(f.metrics.count(SECONDARY_WRITE_FAILURE), 0);
    }

    #[tokio::test]
    async fn test_update_missing_in_legacy_propagates_not_found() {
        let f = fixture();
        let mut ghost = TaskState::new("t1", "a1", json!({}));
        ghost.id = Some("ghost".into());

        let err = f
            .writer
            .update(MigrationPhase::DualWrite, ghost)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(f.target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_in_target_is_not_a_failure() {
        let f = fixture();
        let created = f
            .writer
            .create(MigrationPhase::Legacy, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();

        f.writer
            .delete(MigrationPhase::DualWrite, created.id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(f.metrics.count(SECONDARY_WRITE_FAILURE), 0);
    }

    #[tokio::test]
    async fn test_batch_mirrors_whole_batch_with_legacy_ids() {
        let f = fixture();
        let created = f
            .writer
            .batch_create(
                MigrationPhase::DualWrite,
                vec![
                    TaskState::new("t1", "a1", json!({})),
                    TaskState::new("t2", "a1", json!({})),
                ],
            )
            .await
            .unwrap();

        let ids: Vec<Option<String>> = created.iter().map(|e| e.id.clone()).collect();
        assert_eq!(f.target.calls(), vec![StoreCall::BatchCreate(ids)]);
        assert_eq!(f.target.memory().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_legacy_batch_never_reaches_target() {
        let f = fixture();
        f.legacy.set_fail_writes(true);
        let result = f
            .writer
            .batch_create(
                MigrationPhase::DualRead,
                vec![TaskState::new("t1", "a1", json!({}))],
            )
            .await;
        assert!(result.is_err());
        assert!(f.target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_timeout_counts_as_failure() {
        let f = fixture_with(
            RecordingStore::new("legacy"),
            RecordingStore::new("target").delayed(Duration::from_millis(200)),
            SecondaryPolicy {
                timeout: Some(Duration::from_millis(10)),
                write_mode: SecondaryWriteMode::Await,
            },
        );

        f.writer
            .create(MigrationPhase::DualWrite, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();
        assert_eq!(f.metrics.count(SECONDARY_WRITE_FAILURE), 1);
        assert!(f.target.memory().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_drop_target_write() {
        let f = fixture_with(
            RecordingStore::new("legacy"),
            RecordingStore::new("target").delayed(Duration::from_millis(50)),
            SecondaryPolicy::default(),
        );

        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            f.writer
                .create(MigrationPhase::DualWrite, TaskState::new("t1", "a1", json!({}))),
        )
        .await;
        assert!(outcome.is_err(), "caller should have given up first");
        assert_eq!(f.legacy.memory().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.target.memory().len(), 1);
        assert_eq!(f.metrics.count(SECONDARY_WRITE_FAILURE), 0);
    }

    #[tokio::test]
    async fn test_detached_write_completes_in_background() {
        let f = fixture_with(
            RecordingStore::new("legacy"),
            RecordingStore::new("target").delayed(Duration::from_millis(20)),
            SecondaryPolicy {
                timeout: None,
                write_mode: SecondaryWriteMode::Detached,
            },
        );

        let created = f
            .writer
            .create(MigrationPhase::DualWrite, TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();
        assert!(f.target.memory().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mirrored = f
            .target
            .memory()
            .get(created.id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(mirrored.is_some());
    }
}
