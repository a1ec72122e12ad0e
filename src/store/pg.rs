//! PostgreSQL entity store, the relational target of the migration.
//!
//! Requires the `postgres` feature flag:
//! ```toml
//! [dependencies]
//! agent-control-plane = { features = ["postgres"] }
//! ```
//!
//! Each entity kind gets its own table (`task_states`, `task_messages`) with
//! the full entity kept as JSONB next to the indexed key columns. The store
//! never generates an id when one is supplied, so rows stay correlatable with
//! the legacy store by `id`.

#[cfg(feature = "postgres")]
mod inner {
    use std::marker::PhantomData;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use sqlx::PgPool;

    use crate::store::{assign_id, require_id, Entity, EntityStore, ListQuery, StoreError};

    /// PostgreSQL store for one entity kind.
    pub struct PgEntityStore<E> {
        pool: PgPool,
        table: String,
        _entity: PhantomData<fn() -> E>,
    }

    impl<E> Clone for PgEntityStore<E> {
        fn clone(&self) -> Self {
            Self {
                pool: self.pool.clone(),
                table: self.table.clone(),
                _entity: PhantomData,
            }
        }
    }

    impl<E: Entity> PgEntityStore<E> {
        pub fn new(pool: PgPool) -> Self {
            Self {
                pool,
                table: format!("{}s", E::KIND),
                _entity: PhantomData,
            }
        }

        pub fn table(&self) -> &str {
            &self.table
        }

        /// Create the entity table and its indexes if they do not exist.
        pub async fn ensure_table(&self) -> Result<(), StoreError> {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    natural_key TEXT NOT NULL,
                    document JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    CONSTRAINT {table}_natural_key_unique UNIQUE (natural_key)
                )
                "#,
                table = self.table
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table} (created_at)",
                table = self.table
            ))
            .execute(&self.pool)
            .await?;

            log::debug!("{} table ready", self.table);
            Ok(())
        }

        async fn insert<'c, X>(&self, executor: X, id: &str, entity: &E) -> Result<(), StoreError>
        where
            X: sqlx::PgExecutor<'c>,
        {
            let document = serde_json::to_value(entity)?;
            let natural_key = entity.natural_key().to_string();
            sqlx::query(&format!(
                "INSERT INTO {} (id, natural_key, document, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5)",
                self.table
            ))
            .bind(id)
            .bind(&natural_key)
            .bind(&document)
            .bind(entity.created_at())
            .bind(entity.updated_at())
            .execute(executor)
            .await
            .map_err(|err| unique_violation(err, id, &natural_key, E::KIND))?;
            Ok(())
        }
    }

    /// Translate a unique-constraint failure into [`StoreError::DuplicateKey`].
    fn unique_violation(
        err: sqlx::Error,
        id: &str,
        natural_key: &str,
        kind: &'static str,
    ) -> StoreError {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                let on_natural_key = db
                    .constraint()
                    .is_some_and(|name| name.ends_with("natural_key_unique"));
                let key = if on_natural_key { natural_key } else { id };
                return StoreError::duplicate(kind, key);
            }
        }
        err.into()
    }

    fn decode<E: Entity>(document: Value) -> Result<E, StoreError> {
        Ok(serde_json::from_value(document)?)
    }

    #[async_trait]
    impl<E: Entity> EntityStore<E> for PgEntityStore<E> {
        fn name(&self) -> &str {
            "postgres"
        }

        async fn create(&self, mut entity: E) -> Result<E, StoreError> {
            let id = assign_id(&mut entity);
            self.insert(&self.pool, &id, &entity).await?;
            Ok(entity)
        }

        async fn get(&self, id: &str) -> Result<Option<E>, StoreError> {
            let document: Option<Value> = sqlx::query_scalar(&format!(
                "SELECT document FROM {} WHERE id = $1",
                self.table
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            document.map(decode).transpose()
        }

        async fn get_by_natural_key(&self, key: &E::NaturalKey) -> Result<Option<E>, StoreError> {
            let document: Option<Value> = sqlx::query_scalar(&format!(
                "SELECT document FROM {} WHERE natural_key = $1",
                self.table
            ))
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
            document.map(decode).transpose()
        }

        async fn update(&self, mut entity: E) -> Result<E, StoreError> {
            let id = require_id(&entity)?;
            entity.touch(Utc::now());
            let document = serde_json::to_value(&entity)?;
            let natural_key = entity.natural_key().to_string();

            let result = sqlx::query(&format!(
                "UPDATE {} SET natural_key = $2, document = $3, updated_at = $4 WHERE id = $1",
                self.table
            ))
            .bind(&id)
            .bind(&natural_key)
            .bind(&document)
            .bind(entity.updated_at())
            .execute(&self.pool)
            .await
            .map_err(|err| unique_violation(err, &id, &natural_key, E::KIND))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::not_found(E::KIND, id));
            }
            Ok(entity)
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found(E::KIND, id));
            }
            Ok(())
        }

        async fn list(&self, query: &ListQuery) -> Result<Vec<E>, StoreError> {
            let offset = query.offset()?;
            let (predicates, params) = super::filter_clause(&query.filter);
            let direction = query.order_by.direction();

            let sql = format!(
                "SELECT document FROM {table} {predicates}
                 ORDER BY {column} {direction}, id {direction}
                 LIMIT ${limit} OFFSET ${offset}",
                table = self.table,
                column = query.order_by.field.column(),
                limit = params + 1,
                offset = params + 2,
            );
            let mut statement = sqlx::query_scalar::<_, Value>(&sql);
            for (field, value) in &query.filter {
                statement = statement.bind(field.clone());
                if !value.is_null() {
                    statement = statement.bind(value.clone());
                }
            }
            let documents = statement
                .bind(query.limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;

            documents.into_iter().map(decode).collect()
        }

        async fn batch_create(&self, entities: Vec<E>) -> Result<Vec<E>, StoreError> {
            let mut tx = self.pool.begin().await?;
            let mut created = Vec::with_capacity(entities.len());
            for mut entity in entities {
                let id = assign_id(&mut entity);
                self.insert(&mut *tx, &id, &entity).await?;
                created.push(entity);
            }
            tx.commit().await?;
            Ok(created)
        }
    }
}

#[cfg(feature = "postgres")]
pub use inner::*;

/// `WHERE` clause for equality filters on top-level document fields, and the
/// number of parameters it binds.
///
/// Each field binds its name, then its value unless the value is `null`. A
/// `null` filter matches a missing field as well as an explicit null.
#[cfg(any(test, feature = "postgres"))]
fn filter_clause(
    filter: &std::collections::BTreeMap<String, serde_json::Value>,
) -> (String, usize) {
    let mut params = 0;
    let mut predicates = Vec::with_capacity(filter.len());
    for value in filter.values() {
        let field = params + 1;
        if value.is_null() {
            predicates.push(format!(
                "(document -> ${field}::text IS NULL OR document -> ${field}::text = 'null'::jsonb)"
            ));
            params += 1;
        } else {
            predicates.push(format!(
                "document -> ${field}::text = ${}::jsonb",
                field + 1
            ));
            params += 2;
        }
    }
    if predicates.is_empty() {
        return (String::new(), 0);
    }
    (format!("WHERE {}", predicates.join(" AND ")), params)
}
