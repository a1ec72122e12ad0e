//! Offline reconciliation between the legacy and target stores.
//!
//! Run before cutover, outside the request path:
//!
//! - [`backfill`] copies legacy records the target does not have yet
//! - [`verify`] audits target records against legacy and optionally repairs them
//!
//! Both walk the legacy store page by page in `created_at` order and keep
//! the legacy id for every record they write.

pub mod backfill;
pub mod verify;

pub use backfill::{backfill, BackfillOptions, BackfillReport};
pub use verify::{verify, Discrepancy, VerifyOptions, VerifyReport};

use crate::store::{Entity, EntityStore, ListQuery, OrderBy, Page, SortField, StoreError};

/// Default number of legacy records fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default number of records processed at once within a page.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Fetch one page (1-based) of legacy records in stable order.
pub(crate) async fn legacy_page<E, L>(
    legacy: &L,
    page_size: usize,
    number: usize,
) -> Result<Vec<E>, StoreError>
where
    E: Entity,
    L: EntityStore<E> + ?Sized,
{
    let query = ListQuery::new()
        .limit(page_size)
        .page(Page::Number(number))
        .order_by(OrderBy::ascending(SortField::CreatedAt));
    legacy.list(&query).await
}
