//! Verify: audit target records against legacy.
//!
//! Uses the same classification as the online comparator. With `repair`
//! set, a missing target record is created from legacy and a mismatched
//! one is overwritten from legacy.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::{legacy_page, DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE};
use crate::migration::comparator::{classify, preview};
use crate::migration::DiscrepancyCategory;
use crate::store::{Entity, EntityStore, StoreError};

/// At most this many discrepancies are kept in [`VerifyReport::samples`].
pub const MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyOptions {
    /// Check only the first N legacy records; `None` checks all of them.
    pub sample: Option<usize>,
    pub page_size: usize,
    pub concurrency: usize,
    pub repair: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            sample: None,
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            repair: false,
        }
    }
}

/// One record that did not match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: String,
    pub category: DiscrepancyCategory,
    pub legacy: String,
    pub target: Option<String>,
    pub repaired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub matched: usize,
    pub missing_in_target: usize,
    pub content_mismatch: usize,
    /// Target lookups that failed, so the record could not be checked.
    pub target_unavailable: usize,
    pub repaired: usize,
    pub repair_failed: usize,
    pub samples: Vec<Discrepancy>,
}

impl VerifyReport {
    /// Discrepancies still present after repair.
    pub fn unresolved(&self) -> usize {
        (self.missing_in_target + self.content_mismatch + self.target_unavailable)
            .saturating_sub(self.repaired)
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved() == 0
    }

    fn record(&mut self, outcome: Checked) {
        self.checked += 1;
        let Some(discrepancy) = outcome.discrepancy else {
            self.matched += 1;
            return;
        };
        match discrepancy.category {
            DiscrepancyCategory::MissingInTarget => self.missing_in_target += 1,
            DiscrepancyCategory::ContentMismatch => self.content_mismatch += 1,
            DiscrepancyCategory::TargetUnavailable => self.target_unavailable += 1,
            _ => {}
        }
        match outcome.repair {
            Some(true) => self.repaired += 1,
            Some(false) => self.repair_failed += 1,
            None => {}
        }
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(discrepancy);
        }
    }
}

struct Checked {
    discrepancy: Option<Discrepancy>,
    /// `Some(ok)` when a repair was attempted.
    repair: Option<bool>,
}

/// Compare legacy records with their target counterparts by id.
///
/// Records only the target has are not found by this walk.
pub async fn verify<E, L, T>(
    legacy: &L,
    target: &T,
    options: &VerifyOptions,
) -> Result<VerifyReport, StoreError>
where
    E: Entity,
    L: EntityStore<E> + ?Sized,
    T: EntityStore<E> + ?Sized,
{
    let page_size = options.page_size.max(1);
    let mut report = VerifyReport::default();
    let mut page_number = 1;

    loop {
        let remaining = options.sample.map(|n| n.saturating_sub(report.checked));
        if remaining == Some(0) {
            break;
        }
        let mut page = legacy_page(legacy, page_size, page_number).await?;
        let fetched = page.len();
        if let Some(remaining) = remaining {
            page.truncate(remaining);
        }
        if page.is_empty() {
            break;
        }

        let outcomes: Vec<Checked> = stream::iter(page)
            .map(|entity| check_one(target, entity, options.repair))
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        if fetched < page_size {
            break;
        }
        page_number += 1;
    }

    log::info!(
        "verify {}: checked={} matched={} missing_in_target={} content_mismatch={} target_unavailable={} repaired={} repair_failed={}",
        E::KIND,
        report.checked,
        report.matched,
        report.missing_in_target,
        report.content_mismatch,
        report.target_unavailable,
        report.repaired,
        report.repair_failed
    );
    Ok(report)
}

async fn check_one<E, T>(target: &T, legacy: E, repair: bool) -> Checked
where
    E: Entity,
    T: EntityStore<E> + ?Sized,
{
    let id = legacy.id().unwrap_or_default().to_string();
    let legacy_preview = preview(&legacy.payload());

    let found = match target.get(&id).await {
        Ok(found) => found,
        Err(err) => {
            log::warn!("verify {} {}: target lookup failed: {}", E::KIND, id, err);
            return Checked {
                discrepancy: Some(Discrepancy {
                    id,
                    category: DiscrepancyCategory::TargetUnavailable,
                    legacy: legacy_preview,
                    target: None,
                    repaired: false,
                }),
                repair: None,
            };
        }
    };

    let category = classify(Some(&legacy), found.as_ref());
    if category == Some(DiscrepancyCategory::Match) {
        return Checked {
            discrepancy: None,
            repair: None,
        };
    }
    let category = category.unwrap_or(DiscrepancyCategory::MissingInTarget);
    let target_preview = found.as_ref().map(|e| preview(&e.payload()));
    log::warn!(
        "verify {} {}: {} legacy={} target={}",
        E::KIND,
        id,
        category,
        legacy_preview,
        target_preview.as_deref().unwrap_or("-")
    );

    let repair = if repair {
        let result = match category {
            DiscrepancyCategory::MissingInTarget => target.create(legacy).await,
            _ => target.update(legacy).await,
        };
        if let Err(err) = &result {
            log::error!("verify {} {}: repair failed: {}", E::KIND, id, err);
        }
        Some(result.is_ok())
    } else {
        None
    };

    Checked {
        discrepancy: Some(Discrepancy {
            id,
            category,
            legacy: legacy_preview,
            target: target_preview,
            repaired: repair == Some(true),
        }),
        repair,
    }
}
