//! Backfill: copy legacy records missing from the target.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::{legacy_page, DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE};
use crate::store::{Entity, EntityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillOptions {
    pub page_size: usize,
    /// Stop after this many pages; `None` walks the whole legacy store.
    pub max_pages: Option<usize>,
    pub concurrency: usize,
    /// Count what would be copied without writing anything.
    pub dry_run: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: None,
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub pages: usize,
    pub scanned: usize,
    /// Records written to the target (or that would be, on a dry run).
    pub created: usize,
    /// Records the target already had.
    pub skipped: usize,
    pub failed: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Skipped,
    Failed,
}

/// Copy every legacy record the target lacks, keeping its id.
///
/// A failing legacy page aborts the run; a failing record is counted and
/// the run continues.
pub async fn backfill<E, L, T>(
    legacy: &L,
    target: &T,
    options: &BackfillOptions,
) -> Result<BackfillReport, StoreError>
where
    E: Entity,
    L: EntityStore<E> + ?Sized,
    T: EntityStore<E> + ?Sized,
{
    let page_size = options.page_size.max(1);
    let mut report = BackfillReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    log::info!(
        "backfill {} from {} to {} (page_size={} dry_run={})",
        E::KIND,
        legacy.name(),
        target.name(),
        page_size,
        options.dry_run
    );

    loop {
        if options.max_pages.is_some_and(|max| report.pages >= max) {
            break;
        }
        let page = legacy_page(legacy, page_size, report.pages + 1).await?;
        let fetched = page.len();
        if fetched == 0 {
            break;
        }
        report.pages += 1;
        report.scanned += fetched;

        let outcomes: Vec<Outcome> = stream::iter(page)
            .map(|entity| copy_one(target, entity, options.dry_run))
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                Outcome::Created => report.created += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        log::debug!(
            "backfill {} page {}: scanned={} created={} skipped={} failed={}",
            E::KIND,
            report.pages,
            report.scanned,
            report.created,
            report.skipped,
            report.failed
        );

        if fetched < page_size {
            break;
        }
    }

    log::info!("backfill {} finished: {:?}", E::KIND, report);
    Ok(report)
}

async fn copy_one<E, T>(target: &T, entity: E, dry_run: bool) -> Outcome
where
    E: Entity,
    T: EntityStore<E> + ?Sized,
{
    let Some(id) = entity.id().map(str::to_string) else {
        log::warn!("backfill {}: legacy record without id skipped", E::KIND);
        return Outcome::Failed;
    };

    match target.get(&id).await {
        Ok(Some(_)) => return Outcome::Skipped,
        Ok(None) => {}
        Err(err) => {
            log::warn!("backfill {} {}: target lookup failed: {}", E::KIND, id, err);
            return Outcome::Failed;
        }
    }

    if dry_run {
        return Outcome::Created;
    }

    match target.create(entity).await {
        Ok(_) => Outcome::Created,
        Err(err) => {
            log::warn!("backfill {} {}: target create failed: {}", E::KIND, id, err);
            Outcome::Failed
        }
    }
}
