//! Migration router facade.
//!
//! The only type callers see. It resolves the phase for each call and hands
//! the operation to the write coordinator or the read router. Holds no
//! per-call state, so one instance is shared behind an `Arc` by every
//! request handler.

use std::sync::Arc;
use std::time::Duration;

use super::comparator::ConsistencyComparator;
use super::error::MigrationError;
use super::metrics::{MetricsEmitter, MetricsSink, NoopMetrics};
use super::phase::{MigrationPhase, PhaseResolver};
use super::reader::ReadRouter;
use super::writer::{SecondaryPolicy, SecondaryWriteMode, WriteCoordinator};
use crate::config::StoreMigrationConfig;
use crate::store::{Entity, ListQuery, SharedStore};

/// Routes entity operations between the legacy and target stores.
pub struct MigrationRouter<E: Entity> {
    resolver: PhaseResolver,
    writer: WriteCoordinator<E>,
    reader: ReadRouter<E>,
    legacy_name: String,
    target_name: String,
}

impl<E: Entity> MigrationRouter<E> {
    /// Router with default policy and no metrics.
    pub fn new(phase: MigrationPhase, legacy: SharedStore<E>, target: SharedStore<E>) -> Self {
        Self::builder(legacy, target).phase(phase).build()
    }

    pub fn builder(legacy: SharedStore<E>, target: SharedStore<E>) -> MigrationRouterBuilder<E> {
        MigrationRouterBuilder::new(legacy, target)
    }

    /// Build from loaded configuration. Fails when the configured phase is
    /// not one of the four known values.
    pub fn from_config(
        config: &StoreMigrationConfig,
        legacy: SharedStore<E>,
        target: SharedStore<E>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, MigrationError> {
        let phase = config.phase()?;
        Ok(Self::builder(legacy, target)
            .phase(phase)
            .metrics(sink)
            .secondary_policy(config.secondary_policy())
            .compare_lists(config.list_compare)
            .build())
    }

    /// The configured phase.
    pub fn phase(&self) -> MigrationPhase {
        self.resolver.static_phase()
    }

    /// The phase a call carrying `phase_override` would run under.
    pub fn resolve_phase(&self, phase_override: Option<&str>) -> MigrationPhase {
        self.resolver.resolve(phase_override)
    }

    pub async fn create(&self, entity: E, phase_override: Option<&str>) -> Result<E, MigrationError> {
        let phase = self.enter("create", phase_override);
        self.writer.create(phase, entity).await
    }

    pub async fn get(&self, id: &str, phase_override: Option<&str>) -> Result<Option<E>, MigrationError> {
        let phase = self.enter("get", phase_override);
        self.reader.get(phase, id).await
    }

    pub async fn get_by_natural_key(
        &self,
        key: &E::NaturalKey,
        phase_override: Option<&str>,
    ) -> Result<Option<E>, MigrationError> {
        let phase = self.enter("get_by_key", phase_override);
        self.reader.get_by_natural_key(phase, key).await
    }

    pub async fn update(&self, entity: E, phase_override: Option<&str>) -> Result<E, MigrationError> {
        let phase = self.enter("update", phase_override);
        self.writer.update(phase, entity).await
    }

    pub async fn delete(&self, id: &str, phase_override: Option<&str>) -> Result<(), MigrationError> {
        let phase = self.enter("delete", phase_override);
        self.writer.delete(phase, id).await
    }

    pub async fn list(&self, query: &ListQuery, phase_override: Option<&str>) -> Result<Vec<E>, MigrationError> {
        let phase = self.enter("list", phase_override);
        self.reader.list(phase, query).await
    }

    pub async fn batch_create(
        &self,
        entities: Vec<E>,
        phase_override: Option<&str>,
    ) -> Result<Vec<E>, MigrationError> {
        let phase = self.enter("batch_create", phase_override);
        self.writer.batch_create(phase, entities).await
    }

    fn enter(&self, operation: &str, phase_override: Option<&str>) -> MigrationPhase {
        let phase = self.resolver.resolve(phase_override);
        log::debug!(
            "{} {} phase={} legacy={} target={}",
            E::KIND,
            operation,
            phase,
            self.legacy_name,
            self.target_name
        );
        phase
    }
}

impl<E: Entity> std::fmt::Debug for MigrationRouter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRouter")
            .field("entity", &E::KIND)
            .field("phase", &self.phase())
            .field("legacy", &self.legacy_name)
            .field("target", &self.target_name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`MigrationRouter`].
pub struct MigrationRouterBuilder<E: Entity> {
    legacy: SharedStore<E>,
    target: SharedStore<E>,
    phase: MigrationPhase,
    sink: Arc<dyn MetricsSink>,
    policy: SecondaryPolicy,
    compare_lists: bool,
}

impl<E: Entity> MigrationRouterBuilder<E> {
    fn new(legacy: SharedStore<E>, target: SharedStore<E>) -> Self {
        Self {
            legacy,
            target,
            phase: MigrationPhase::default(),
            sink: Arc::new(NoopMetrics),
            policy: SecondaryPolicy::default(),
            compare_lists: true,
        }
    }

    pub fn phase(mut self, phase: MigrationPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn secondary_policy(mut self, policy: SecondaryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn secondary_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn secondary_writes(mut self, mode: SecondaryWriteMode) -> Self {
        self.policy.write_mode = mode;
        self
    }

    pub fn compare_lists(mut self, enabled: bool) -> Self {
        self.compare_lists = enabled;
        self
    }

    pub fn build(self) -> MigrationRouter<E> {
        let emitter = MetricsEmitter::new(self.sink, E::KIND);
        let legacy_name = self.legacy.name().to_string();
        let target_name = self.target.name().to_string();
        let writer = WriteCoordinator::new(
            Arc::clone(&self.legacy),
            Arc::clone(&self.target),
            self.policy,
            emitter.clone(),
        );
        let reader = ReadRouter::new(
            self.legacy,
            self.target,
            ConsistencyComparator::new(emitter),
            self.policy.timeout,
        )
        .with_list_comparison(self.compare_lists);

        MigrationRouter {
            resolver: PhaseResolver::new(self.phase),
            writer,
            reader,
            legacy_name,
            target_name,
        }
    }
}
