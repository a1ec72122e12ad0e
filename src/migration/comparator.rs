//! Consistency comparator for the `dual_read` phase.
//!
//! Classifies the pair of results fetched from the legacy and target stores
//! and reports each classification through the metrics emitter. It keeps no
//! state and never fails; discrepancies are observations, not errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::metrics::{
    MetricsEmitter, Operation, DUAL_READ_CONTENT_MISMATCH, DUAL_READ_LIST_COUNT_DIFF,
    DUAL_READ_LIST_COUNT_MISMATCH, DUAL_READ_MATCH, DUAL_READ_MISSING_LEGACY,
    DUAL_READ_MISSING_TARGET, DUAL_READ_TARGET_UNAVAILABLE,
};
use crate::store::{Entity, StoreError};

/// Maximum characters of a payload included in mismatch logs.
pub const PREVIEW_LEN: usize = 100;

/// Outcome of comparing the two stores for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyCategory {
    Match,
    MissingInTarget,
    MissingInLegacy,
    ContentMismatch,
    ListCountMismatch,
    /// The target read failed or timed out, so nothing could be compared.
    TargetUnavailable,
}

impl DiscrepancyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::MissingInTarget => "missing_in_target",
            Self::MissingInLegacy => "missing_in_legacy",
            Self::ContentMismatch => "content_mismatch",
            Self::ListCountMismatch => "list_count_mismatch",
            Self::TargetUnavailable => "target_unavailable",
        }
    }

    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::Match => DUAL_READ_MATCH,
            Self::MissingInTarget => DUAL_READ_MISSING_TARGET,
            Self::MissingInLegacy => DUAL_READ_MISSING_LEGACY,
            Self::ContentMismatch => DUAL_READ_CONTENT_MISMATCH,
            Self::ListCountMismatch => DUAL_READ_LIST_COUNT_MISMATCH,
            Self::TargetUnavailable => DUAL_READ_TARGET_UNAVAILABLE,
        }
    }

    pub fn is_discrepancy(&self) -> bool {
        !matches!(self, Self::Match)
    }
}

impl std::fmt::Display for DiscrepancyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was being read when the comparison happened.
#[derive(Debug, Clone, Copy)]
pub struct CompareContext<'a> {
    pub operation: Operation,
    /// The id or natural key that was looked up.
    pub key: &'a str,
}

/// Classify a pair of single-entity results without reporting anything.
///
/// Returns `None` when both sides are absent: there is nothing to compare.
pub fn classify<E: Entity>(legacy: Option<&E>, target: Option<&E>) -> Option<DiscrepancyCategory> {
    match (legacy, target) {
        (None, None) => None,
        (None, Some(_)) => Some(DiscrepancyCategory::MissingInLegacy),
        (Some(_), None) => Some(DiscrepancyCategory::MissingInTarget),
        (Some(legacy), Some(target)) => {
            if legacy.payload() == target.payload() {
                Some(DiscrepancyCategory::Match)
            } else {
                Some(DiscrepancyCategory::ContentMismatch)
            }
        }
    }
}

/// Compact JSON of a payload, cut to [`PREVIEW_LEN`] characters.
pub fn preview(payload: &Value) -> String {
    let text = payload.to_string();
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}

/// Reports dual-read comparisons through a [`MetricsEmitter`].
#[derive(Debug, Clone)]
pub struct ConsistencyComparator {
    metrics: MetricsEmitter,
}

impl ConsistencyComparator {
    pub fn new(metrics: MetricsEmitter) -> Self {
        Self { metrics }
    }

    /// Compare one legacy/target pair and report the outcome.
    pub fn compare<E: Entity>(
        &self,
        legacy: Option<&E>,
        target: Option<&E>,
        ctx: &CompareContext<'_>,
    ) -> Option<DiscrepancyCategory> {
        let category = classify(legacy, target)?;
        match category {
            DiscrepancyCategory::MissingInLegacy => {
                log::warn!(
                    "dual_read {}: {} {} exists in target but not in legacy",
                    ctx.operation,
                    E::KIND,
                    ctx.key
                );
            }
            DiscrepancyCategory::MissingInTarget => {
                log::debug!(
                    "dual_read {}: {} {} missing in target",
                    ctx.operation,
                    E::KIND,
                    ctx.key
                );
            }
            DiscrepancyCategory::ContentMismatch => {
                let legacy_preview = legacy.map(|e| preview(&e.payload())).unwrap_or_default();
                let target_preview = target.map(|e| preview(&e.payload())).unwrap_or_default();
                log::warn!(
                    "dual_read {}: {} {} content mismatch legacy={} target={}",
                    ctx.operation,
                    E::KIND,
                    ctx.key,
                    legacy_preview,
                    target_preview
                );
            }
            _ => {}
        }
        self.metrics.count(category.metric_name(), ctx.operation);
        Some(category)
    }

    /// Report a target read that failed instead of returning a result.
    pub fn report_target_unavailable(&self, kind: &str, ctx: &CompareContext<'_>, err: &StoreError) {
        log::warn!(
            "dual_read {}: target read of {} {} failed: {}",
            ctx.operation,
            kind,
            ctx.key,
            err
        );
        self.metrics
            .count(DiscrepancyCategory::TargetUnavailable.metric_name(), ctx.operation);
    }

    /// Compare list cardinality only. Returns `true` when the counts agree.
    pub fn compare_counts<E: Entity>(&self, legacy: &[E], target: &[E], operation: Operation) -> bool {
        if legacy.len() == target.len() {
            return true;
        }
        let diff = legacy.len().abs_diff(target.len()) as u64;
        log::warn!(
            "dual_read {}: {} list count mismatch legacy={} target={}",
            operation,
            E::KIND,
            legacy.len(),
            target.len()
        );
        self.metrics.count(DUAL_READ_LIST_COUNT_MISMATCH, operation);
        self.metrics.gauge(DUAL_READ_LIST_COUNT_DIFF, diff, operation);
        false
    }
}
