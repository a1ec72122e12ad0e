//! In-process entity store.
//!
//! Keeps records in a map behind a `parking_lot` lock. Used by tests and by
//! the server when no relational database is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{
    assign_id, matches_filter, require_id, sort_entities, Entity, EntityStore, ListQuery,
    StoreError,
};

#[derive(Debug)]
struct Records<E> {
    by_id: HashMap<String, E>,
    /// natural key -> id
    natural_keys: HashMap<String, String>,
}

/// Map-backed [`EntityStore`].
#[derive(Debug)]
pub struct MemoryStore<E: Entity> {
    name: String,
    records: RwLock<Records<E>>,
}

impl<E: Entity> MemoryStore<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(Records {
                by_id: HashMap::new(),
                natural_keys: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert without any of the create checks. Test setups use this to
    /// seed divergent data.
    pub fn insert_raw(&self, entity: E) {
        let Some(id) = entity.id().map(str::to_string) else {
            return;
        };
        let mut records = self.records.write();
        records
            .natural_keys
            .insert(entity.natural_key().to_string(), id.clone());
        records.by_id.insert(id, entity);
    }

    fn check_free(records: &Records<E>, id: &str, key: &str) -> Result<(), StoreError> {
        if records.by_id.contains_key(id) {
            return Err(StoreError::duplicate(E::KIND, id));
        }
        if records.natural_keys.contains_key(key) {
            return Err(StoreError::duplicate(E::KIND, key));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> EntityStore<E> for MemoryStore<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, mut entity: E) -> Result<E, StoreError> {
        let id = assign_id(&mut entity);
        let key = entity.natural_key().to_string();

        let mut records = self.records.write();
        Self::check_free(&records, &id, &key)?;
        records.natural_keys.insert(key, id.clone());
        records.by_id.insert(id, entity.clone());
        Ok(entity)
    }

    async fn get(&self, id: &str) -> Result<Option<E>, StoreError> {
        Ok(self.records.read().by_id.get(id).cloned())
    }

    async fn get_by_natural_key(&self, key: &E::NaturalKey) -> Result<Option<E>, StoreError> {
        let records = self.records.read();
        Ok(records
            .natural_keys
            .get(&key.to_string())
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    async fn update(&self, mut entity: E) -> Result<E, StoreError> {
        let id = require_id(&entity)?;
        let key = entity.natural_key().to_string();

        let mut records = self.records.write();
        let previous_key = match records.by_id.get(&id) {
            Some(existing) => existing.natural_key().to_string(),
            None => return Err(StoreError::not_found(E::KIND, id)),
        };
        if previous_key != key {
            if records.natural_keys.contains_key(&key) {
                return Err(StoreError::duplicate(E::KIND, key));
            }
            records.natural_keys.remove(&previous_key);
            records.natural_keys.insert(key, id.clone());
        }

        entity.touch(Utc::now());
        records.by_id.insert(id, entity.clone());
        Ok(entity)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.by_id.remove(id) {
            Some(removed) => {
                records
                    .natural_keys
                    .remove(&removed.natural_key().to_string());
                Ok(())
            }
            None => Err(StoreError::not_found(E::KIND, id)),
        }
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<E>, StoreError> {
        let offset = query.offset()?;
        let mut matched = Vec::new();
        {
            let records = self.records.read();
            for entity in records.by_id.values() {
                let document = serde_json::to_value(entity)?;
                if matches_filter(&document, &query.filter) {
                    matched.push(entity.clone());
                }
            }
        }
        sort_entities(&mut matched, &query.order_by);
        Ok(matched.into_iter().skip(offset).take(query.limit).collect())
    }

    async fn batch_create(&self, entities: Vec<E>) -> Result<Vec<E>, StoreError> {
        let mut prepared = Vec::with_capacity(entities.len());
        for mut entity in entities {
            let id = assign_id(&mut entity);
            let key = entity.natural_key().to_string();
            prepared.push((id, key, entity));
        }

        let mut records = self.records.write();
        let mut batch_ids = std::collections::HashSet::new();
        let mut batch_keys = std::collections::HashSet::new();
        for (id, key, _) in &prepared {
            Self::check_free(&records, id, key)?;
            if !batch_ids.insert(id.as_str()) {
                return Err(StoreError::duplicate(E::KIND, id.as_str()));
            }
            if !batch_keys.insert(key.as_str()) {
                return Err(StoreError::duplicate(E::KIND, key.as_str()));
            }
        }

        let mut created = Vec::with_capacity(prepared.len());
        for (id, key, entity) in prepared {
            records.natural_keys.insert(key, id.clone());
            records.by_id.insert(id, entity.clone());
            created.push(entity);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{TaskMessage, TaskState, TaskStateKey};
    use crate::store::{OrderBy, Page, SortField};
    use serde_json::json;

    #[tokio::test]
    async fn test_create_assigns_id_and_reuses_given_id() {
        let store = MemoryStore::<TaskState>::new("memory");

        let created = store
            .create(TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();
        assert!(created.id.is_some());

        let mut preset = TaskState::new("t2", "a1", json!({}));
        preset.id = Some("abc".into());
        let created = store.create(preset).await.unwrap();
        assert_eq!(created.id.as_deref(), Some("abc"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_natural_key_rejected() {
        let store = MemoryStore::<TaskState>::new("memory");
        store
            .create(TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();

        let err = store
            .create(TaskState::new("t1", "a1", json!({"other": true})))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn test_get_by_natural_key() {
        let store = MemoryStore::<TaskState>::new("memory");
        let created = store
            .create(TaskState::new("t1", "a1", json!({"n": 1})))
            .await
            .unwrap();

        let found = store
            .get_by_natural_key(&TaskStateKey::new("t1", "a1"))
            .await
            .unwrap();
        assert_eq!(found, Some(created));
        assert!(store
            .get_by_natural_key(&TaskStateKey::new("t1", "zz"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_natural_keys_with_separator_stay_distinct() {
        let store = MemoryStore::<TaskState>::new("memory");
        let first = store
            .create(TaskState::new("a/b", "c", json!({"n": 1})))
            .await
            .unwrap();
        let second = store
            .create(TaskState::new("a", "b/c", json!({"n": 2})))
            .await
            .unwrap();

        let found = store
            .get_by_natural_key(&TaskStateKey::new("a", "b/c"))
            .await
            .unwrap();
        assert_eq!(found, Some(second));
        let found = store
            .get_by_natural_key(&TaskStateKey::new("a/b", "c"))
            .await
            .unwrap();
        assert_eq!(found, Some(first));
    }

    #[tokio::test]
    async fn test_update_and_delete_missing() {
        let store = MemoryStore::<TaskMessage>::new("memory");
        let mut ghost = TaskMessage::new("t", "user", json!("hi"));
        ghost.id = Some("ghost".into());

        assert!(store.update(ghost).await.unwrap_err().is_not_found());
        assert!(store.delete("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at() {
        let store = MemoryStore::<TaskState>::new("memory");
        let created = store
            .create(TaskState::new("t1", "a1", json!({"n": 1})))
            .await
            .unwrap();

        let mut changed = created.clone();
        changed.state = json!({"n": 2});
        let updated = store.update(changed).await.unwrap();
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(
            store.get(created.id.as_deref().unwrap()).await.unwrap().unwrap().state,
            json!({"n": 2})
        );
    }

    #[tokio::test]
    async fn test_list_filters_orders_and_pages() {
        let store = MemoryStore::<TaskMessage>::new("memory");
        for i in 0..5 {
            let mut message = TaskMessage::new("t1", "user", json!(i));
            message.id = Some(format!("m{i}"));
            store.create(message).await.unwrap();
        }
        store
            .create(TaskMessage::new("t2", "user", json!("other")))
            .await
            .unwrap();

        let query = ListQuery::new()
            .filter("task_id", "t1")
            .limit(2)
            .page(Page::Number(2))
            .order_by(OrderBy::ascending(SortField::Id));
        let page = store.list(&query).await.unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);

        let descending = ListQuery::new()
            .filter("task_id", "t1")
            .limit(1)
            .order_by(OrderBy::descending(SortField::Id));
        let first = store.list(&descending).await.unwrap();
        assert_eq!(first[0].id.as_deref(), Some("m4"));
    }

    #[tokio::test]
    async fn test_batch_create_is_all_or_nothing() {
        let store = MemoryStore::<TaskState>::new("memory");
        store
            .create(TaskState::new("t1", "a1", json!({})))
            .await
            .unwrap();

        let batch = vec![
            TaskState::new("t2", "a1", json!({})),
            TaskState::new("t1", "a1", json!({})),
        ];
        assert!(store.batch_create(batch).await.unwrap_err().is_duplicate_key());
        assert_eq!(store.len(), 1);

        let batch = vec![
            TaskState::new("t2", "a1", json!({})),
            TaskState::new("t3", "a1", json!({})),
        ];
        let created = store.batch_create(batch).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(store.len(), 3);
    }
}
