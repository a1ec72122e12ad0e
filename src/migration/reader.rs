//! Read router.
//!
//! `legacy` and `dual_write` read legacy only, `target` reads target only.
//! `dual_read` issues both reads concurrently, waits for both, hands the
//! pair to the comparator and answers with the legacy result.

use std::future::Future;
use std::time::Duration;

use super::comparator::{CompareContext, ConsistencyComparator};
use super::error::MigrationError;
use super::metrics::Operation;
use super::phase::MigrationPhase;
use crate::store::{Entity, ListQuery, SharedStore, StoreError};

/// Routes reads to the legacy and/or target store by phase.
pub struct ReadRouter<E: Entity> {
    legacy: SharedStore<E>,
    target: SharedStore<E>,
    comparator: ConsistencyComparator,
    secondary_timeout: Option<Duration>,
    compare_lists: bool,
}

impl<E: Entity> ReadRouter<E> {
    pub fn new(
        legacy: SharedStore<E>,
        target: SharedStore<E>,
        comparator: ConsistencyComparator,
        secondary_timeout: Option<Duration>,
    ) -> Self {
        Self {
            legacy,
            target,
            comparator,
            secondary_timeout,
            compare_lists: true,
        }
    }

    /// Turn list count comparison in `dual_read` on or off.
    pub fn with_list_comparison(mut self, enabled: bool) -> Self {
        self.compare_lists = enabled;
        self
    }

    pub async fn get(&self, phase: MigrationPhase, id: &str) -> Result<Option<E>, MigrationError> {
        match phase {
            MigrationPhase::Legacy | MigrationPhase::DualWrite => Ok(self.legacy.get(id).await?),
            MigrationPhase::Target => Ok(self.target.get(id).await?),
            MigrationPhase::DualRead => {
                let (legacy, target) =
                    tokio::join!(self.legacy.get(id), self.secondary(self.target.get(id)));
                self.observe(Operation::Get, id, legacy, target)
            }
        }
    }

    pub async fn get_by_natural_key(
        &self,
        phase: MigrationPhase,
        key: &E::NaturalKey,
    ) -> Result<Option<E>, MigrationError> {
        match phase {
            MigrationPhase::Legacy | MigrationPhase::DualWrite => {
                Ok(self.legacy.get_by_natural_key(key).await?)
            }
            MigrationPhase::Target => Ok(self.target.get_by_natural_key(key).await?),
            MigrationPhase::DualRead => {
                let (legacy, target) = tokio::join!(
                    self.legacy.get_by_natural_key(key),
                    self.secondary(self.target.get_by_natural_key(key))
                );
                self.observe(Operation::GetByKey, &key.to_string(), legacy, target)
            }
        }
    }

    pub async fn list(&self, phase: MigrationPhase, query: &ListQuery) -> Result<Vec<E>, MigrationError> {
        match phase {
            MigrationPhase::Legacy | MigrationPhase::DualWrite => Ok(self.legacy.list(query).await?),
            MigrationPhase::Target => Ok(self.target.list(query).await?),
            MigrationPhase::DualRead if !self.compare_lists => Ok(self.legacy.list(query).await?),
            MigrationPhase::DualRead => {
                let (legacy, target) =
                    tokio::join!(self.legacy.list(query), self.secondary(self.target.list(query)));
                let legacy = legacy?;
                match target {
                    Ok(target) => {
                        self.comparator
                            .compare_counts(&legacy, &target, Operation::List);
                    }
                    Err(err) => {
                        let ctx = CompareContext {
                            operation: Operation::List,
                            key: "*",
                        };
                        self.comparator
                            .report_target_unavailable(E::KIND, &ctx, &err);
                    }
                }
                Ok(legacy)
            }
        }
    }

    /// Apply the secondary timeout to a target read.
    async fn secondary<T>(
        &self,
        read: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match self.secondary_timeout {
            Some(limit) => tokio::time::timeout(limit, read).await.unwrap_or_else(|_| {
                Err(StoreError::Unavailable(format!(
                    "{} did not answer within {}ms",
                    self.target.name(),
                    limit.as_millis()
                )))
            }),
            None => read.await,
        }
    }

    /// Compare a dual read and pick the caller's answer.
    ///
    /// A legacy failure is the caller's failure; a target failure is only
    /// reported.
    fn observe(
        &self,
        operation: Operation,
        key: &str,
        legacy: Result<Option<E>, StoreError>,
        target: Result<Option<E>, StoreError>,
    ) -> Result<Option<E>, MigrationError> {
        let legacy = legacy?;
        let ctx = CompareContext { operation, key };
        match target {
            Ok(target) => {
                self.comparator.compare(legacy.as_ref(), target.as_ref(), &ctx);
            }
            Err(err) => self.comparator.report_target_unavailable(E::KIND, &ctx, &err),
        }
        Ok(legacy)
    }
}
