//! Document-style entity store on SQLite.
//!
//! This is the legacy side of the migration: every entity kind lives in one
//! `documents` table as a JSON body, keyed by `(kind, id)` with a unique
//! `(kind, natural_key)` index. The store assigns ids, so in every phase but
//! `target` the ids handed to the relational store originate here.
//!
//! rusqlite is synchronous; each call runs on a tokio blocking thread.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;

use super::{
    assign_id, require_id, sortable_timestamp, Entity, EntityStore, ListQuery, StoreError,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        natural_key TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_natural_key
        ON documents(kind, natural_key);
";

/// SQLite-backed document store for one entity kind.
///
/// Several stores (one per kind) may share a database file; each sees only
/// its own `kind` rows.
pub struct SqliteDocumentStore<E> {
    db_path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> std::fmt::Debug for SqliteDocumentStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl<E: Entity> SqliteDocumentStore<E> {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::with_connection(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
            _entity: PhantomData,
        })
    }

    /// Another store on the same connection, for a different entity kind.
    pub fn sibling<F: Entity>(&self) -> SqliteDocumentStore<F> {
        SqliteDocumentStore {
            db_path: self.db_path.clone(),
            conn: Arc::clone(&self.conn),
            _entity: PhantomData,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn run<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            work(&mut guard)
        })
        .await?
    }
}

/// A row ready to be written.
struct DocumentRow {
    id: String,
    natural_key: String,
    body: String,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn from_entity<E: Entity>(id: String, entity: &E) -> Result<Self, StoreError> {
        Ok(Self {
            id,
            natural_key: entity.natural_key().to_string(),
            body: serde_json::to_string(entity)?,
            created_at: sortable_timestamp(entity.created_at()),
            updated_at: sortable_timestamp(entity.updated_at()),
        })
    }
}

fn insert_row(conn: &Connection, kind: &'static str, row: &DocumentRow) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO documents (kind, id, natural_key, body, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            kind,
            row.id,
            row.natural_key,
            row.body,
            row.created_at,
            row.updated_at
        ],
    )
    .map_err(|err| constraint_error(err, kind, row))?;
    Ok(())
}

/// Translate a unique-constraint failure into [`StoreError::DuplicateKey`].
fn constraint_error(err: rusqlite::Error, kind: &'static str, row: &DocumentRow) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            let on_natural_key = message
                .as_deref()
                .is_some_and(|m| m.contains("natural_key"));
            let key = if on_natural_key {
                row.natural_key.clone()
            } else {
                row.id.clone()
            };
            StoreError::duplicate(kind, key)
        }
        _ => err.into(),
    }
}

fn decode<E: Entity>(body: &str) -> Result<E, StoreError> {
    Ok(serde_json::from_str(body)?)
}

/// Convert a JSON filter value into a SQLite comparison operand.
///
/// `json_extract` yields integers for booleans and JSON text for nested
/// values, so those are mapped the same way.
fn filter_operand(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

#[async_trait]
impl<E: Entity> EntityStore<E> for SqliteDocumentStore<E> {
    fn name(&self) -> &str {
        "sqlite-documents"
    }

    async fn create(&self, mut entity: E) -> Result<E, StoreError> {
        let id = assign_id(&mut entity);
        let row = DocumentRow::from_entity(id, &entity)?;
        self.run(move |conn| insert_row(conn, E::KIND, &row)).await?;
        log::debug!("sqlite: created {} {}", E::KIND, entity.id().unwrap_or_default());
        Ok(entity)
    }

    async fn get(&self, id: &str) -> Result<Option<E>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT body FROM documents WHERE kind = ?1 AND id = ?2",
                params![E::KIND, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|body| decode(&body))
            .transpose()
        })
        .await
    }

    async fn get_by_natural_key(&self, key: &E::NaturalKey) -> Result<Option<E>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT body FROM documents WHERE kind = ?1 AND natural_key = ?2",
                params![E::KIND, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|body| decode(&body))
            .transpose()
        })
        .await
    }

    async fn update(&self, mut entity: E) -> Result<E, StoreError> {
        let id = require_id(&entity)?;
        entity.touch(Utc::now());
        let row = DocumentRow::from_entity(id, &entity)?;
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE documents SET natural_key = ?3, body = ?4, updated_at = ?5
                     WHERE kind = ?1 AND id = ?2",
                    params![E::KIND, row.id, row.natural_key, row.body, row.updated_at],
                )
                .map_err(|err| constraint_error(err, E::KIND, &row))?;
            if changed == 0 {
                return Err(StoreError::not_found(E::KIND, row.id.as_str()));
            }
            Ok(())
        })
        .await?;
        Ok(entity)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM documents WHERE kind = ?1 AND id = ?2",
                params![E::KIND, id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(E::KIND, id));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<E>, StoreError> {
        let offset = query.offset()?;
        let mut sql = String::from("SELECT body FROM documents WHERE kind = ?");
        let mut bound: Vec<SqlValue> = vec![SqlValue::Text(E::KIND.to_string())];

        for (field, value) in &query.filter {
            let path = format!("$.{field}");
            match filter_operand(value) {
                Some(operand) => {
                    sql.push_str(" AND json_extract(body, ?) = ?");
                    bound.push(SqlValue::Text(path));
                    bound.push(operand);
                }
                None => {
                    sql.push_str(" AND json_extract(body, ?) IS NULL");
                    bound.push(SqlValue::Text(path));
                }
            }
        }

        let direction = query.order_by.direction();
        sql.push_str(&format!(
            " ORDER BY {} {direction}, id {direction} LIMIT ? OFFSET ?",
            query.order_by.field.column()
        ));
        bound.push(SqlValue::Integer(query.limit as i64));
        bound.push(SqlValue::Integer(offset as i64));

        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bound.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            let mut items = Vec::new();
            for body in rows {
                items.push(decode(&body?)?);
            }
            Ok(items)
        })
        .await
    }

    async fn batch_create(&self, entities: Vec<E>) -> Result<Vec<E>, StoreError> {
        let mut prepared = Vec::with_capacity(entities.len());
        let mut rows = Vec::with_capacity(entities.len());
        for mut entity in entities {
            let id = assign_id(&mut entity);
            rows.push(DocumentRow::from_entity(id, &entity)?);
            prepared.push(entity);
        }

        self.run(move |conn| {
            let tx = conn.transaction()?;
            for row in &rows {
                insert_row(&tx, E::KIND, row)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(prepared)
    }
}
