//! Entity store adapter contract.
//!
//! Both physical backends (the legacy document store and the relational
//! target store) implement [`EntityStore`]. The migration router only ever
//! talks to this trait, so a backend can be swapped or faked without the
//! router noticing.
//!
//! # Modules
//!
//! - [`memory`] — in-process store for tests and local development
//! - [`sqlite`] — document-style store on SQLite (the legacy side)
//! - [`pg`] — (feature `postgres`) relational store on PostgreSQL (the target side)

pub mod memory;
pub mod pg;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteDocumentStore;

/// Default page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A record the stores can persist.
///
/// The router never looks inside an entity beyond what this trait exposes:
/// the identifier, the natural key and the comparable payload.
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Compound lookup key independent of the generated `id`.
    type NaturalKey: Clone + Debug + Display + PartialEq + Send + Sync + 'static;

    /// Stable collection/table name, also used as the `entity` metric tag.
    const KIND: &'static str;

    /// The assigned identifier, `None` before the first successful create.
    fn id(&self) -> Option<&str>;

    fn set_id(&mut self, id: String);

    fn natural_key(&self) -> Self::NaturalKey;

    /// The content compared during consistency checks. Excludes `id` and
    /// the timestamps, which each store is free to stamp on its own.
    fn payload(&self) -> Value;

    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> DateTime<Utc>;

    /// Stamp `updated_at`.
    fn touch(&mut self, at: DateTime<Utc>);
}

/// Generate a fresh entity identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Ensure the entity has an id, generating one when it has none.
pub(crate) fn assign_id<E: Entity>(entity: &mut E) -> String {
    match entity.id() {
        Some(id) => id.to_string(),
        None => {
            let id = new_id();
            entity.set_id(id.clone());
            id
        }
    }
}

pub(crate) fn require_id<E: Entity>(entity: &E) -> Result<String, StoreError> {
    entity
        .id()
        .map(str::to_string)
        .ok_or(StoreError::MissingId { kind: E::KIND })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given id or natural key.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The id or natural key is already taken.
    #[error("duplicate {kind} key: {key}")]
    DuplicateKey { kind: &'static str, key: String },

    /// An operation that needs an id got an entity without one.
    #[error("{kind} has no id")]
    MissingId { kind: &'static str },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid list cursor: {0}")]
    InvalidCursor(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// The backend could not be reached or did not answer in time.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn duplicate(kind: &'static str, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Which column a listing is ordered by. Ties always break on `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Id,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Id => "id",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created_at" => Some(Self::CreatedAt),
            "updated_at" => Some(Self::UpdatedAt),
            "id" => Some(Self::Id),
            _ => None,
        }
    }
}

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: SortField,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn ascending(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    pub fn descending(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }

    pub(crate) fn direction(&self) -> &'static str {
        if self.descending {
            "DESC"
        } else {
            "ASC"
        }
    }
}

/// Page selector: 1-based page number or an opaque cursor from a previous page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Page {
    Number(usize),
    Cursor(String),
}

impl Default for Page {
    fn default() -> Self {
        Self::Number(1)
    }
}

/// Filter, page and order for [`EntityStore::list`].
///
/// Filters are equality matches on top-level fields of the serialized entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: BTreeMap<String, Value>,
    pub limit: usize,
    pub page: Page,
    pub order_by: OrderBy,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: BTreeMap::new(),
            limit: DEFAULT_PAGE_SIZE,
            page: Page::default(),
            order_by: OrderBy::default(),
        }
    }
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Number of records to skip before this page starts.
    ///
    /// Offsets past `i64::MAX` are rejected so SQL adapters can bind them.
    pub fn offset(&self) -> Result<usize, StoreError> {
        match &self.page {
            Page::Number(n) => n
                .saturating_sub(1)
                .checked_mul(self.limit)
                .and_then(bindable_offset)
                .ok_or_else(|| StoreError::InvalidCursor(format!("page {n}"))),
            Page::Cursor(cursor) => decode_cursor(cursor),
        }
    }

    /// Cursor for the page after one that returned `returned` records.
    ///
    /// `None` once a short page signals the end of the listing.
    pub fn next_cursor(&self, returned: usize) -> Result<Option<String>, StoreError> {
        if self.limit == 0 || returned < self.limit {
            return Ok(None);
        }
        let next = self
            .offset()?
            .checked_add(returned)
            .and_then(bindable_offset)
            .ok_or_else(|| StoreError::InvalidCursor(format!("offset past {}", i64::MAX)))?;
        Ok(Some(encode_cursor(next)))
    }
}

fn bindable_offset(offset: usize) -> Option<usize> {
    i64::try_from(offset).is_ok().then_some(offset)
}

const CURSOR_PREFIX: &str = "offset:";

fn encode_cursor(offset: usize) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{CURSOR_PREFIX}{offset}"))
}

fn decode_cursor(cursor: &str) -> Result<usize, StoreError> {
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| StoreError::InvalidCursor(cursor.to_string()))?;
    String::from_utf8(raw)
        .ok()
        .and_then(|text| text.strip_prefix(CURSOR_PREFIX)?.parse().ok())
        .and_then(bindable_offset)
        .ok_or_else(|| StoreError::InvalidCursor(cursor.to_string()))
}

/// Whether a serialized entity satisfies every equality filter.
///
/// A `null` filter value matches a missing field as well as an explicit null.
pub(crate) fn matches_filter(document: &Value, filter: &BTreeMap<String, Value>) -> bool {
    filter.iter().all(|(field, expected)| {
        match document.get(field) {
            Some(actual) => actual == expected,
            None => expected.is_null(),
        }
    })
}

/// Sort entities in place by the requested order, breaking ties on `id`.
pub(crate) fn sort_entities<E: Entity>(items: &mut [E], order: &OrderBy) {
    items.sort_by(|a, b| {
        let primary = match order.field {
            SortField::CreatedAt => a.created_at().cmp(&b.created_at()),
            SortField::UpdatedAt => a.updated_at().cmp(&b.updated_at()),
            SortField::Id => Ordering::Equal,
        };
        let ordering = primary.then_with(|| a.id().cmp(&b.id()));
        if order.descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

/// Timestamp text that sorts lexicographically in time order.
pub(crate) fn sortable_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// Uniform CRUD/list contract against one physical backend.
///
/// Lookups return `Ok(None)` for a missing record; `update` and `delete`
/// return [`StoreError::NotFound`] because there is nothing to act on.
/// Retries, if any, belong inside the adapter.
#[async_trait]
pub trait EntityStore<E: Entity>: Send + Sync {
    /// Backend name used in logs.
    fn name(&self) -> &str;

    /// Persist a new entity. Reuses `entity.id()` when set, otherwise
    /// assigns a fresh id.
    async fn create(&self, entity: E) -> Result<E, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<E>, StoreError>;

    async fn get_by_natural_key(&self, key: &E::NaturalKey) -> Result<Option<E>, StoreError>;

    /// Replace the stored entity with the same id and bump `updated_at`.
    async fn update(&self, entity: E) -> Result<E, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn list(&self, query: &ListQuery) -> Result<Vec<E>, StoreError>;

    /// Create several entities. The default creates them one at a time;
    /// backends with transactions override it to make the batch atomic.
    async fn batch_create(&self, entities: Vec<E>) -> Result<Vec<E>, StoreError> {
        let mut created = Vec::with_capacity(entities.len());
        for entity in entities {
            created.push(self.create(entity).await?);
        }
        Ok(created)
    }
}

/// Shared handle to a store adapter.
pub type SharedStore<E> = Arc<dyn EntityStore<E>>;
