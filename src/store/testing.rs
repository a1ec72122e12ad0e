//! Test double that records every adapter call and can be told to fail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Entity, EntityStore, ListQuery, MemoryStore, StoreError};

/// One adapter call as seen by a [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreCall {
    /// Carries the id the caller supplied (if any).
    Create(Option<String>),
    Get(String),
    GetByNaturalKey(String),
    Update(String),
    Delete(String),
    List,
    BatchCreate(Vec<Option<String>>),
}

#[derive(Debug)]
pub(crate) struct RecordingStore<E: Entity> {
    inner: MemoryStore<E>,
    calls: Mutex<Vec<StoreCall>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    delay: Mutex<Option<Duration>>,
    assigned_ids: Mutex<VecDeque<String>>,
}

impl<E: Entity> RecordingStore<E> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: MemoryStore::new(name),
            calls: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            delay: Mutex::new(None),
            assigned_ids: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn failing_writes(self) -> Self {
        self.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_reads(self) -> Self {
        self.fail_reads.store(true, Ordering::SeqCst);
        self
    }

    /// Every call sleeps this long before doing anything.
    pub(crate) fn delayed(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Creates without an id take the next of these instead of a UUID.
    pub(crate) fn assigning_ids<'a>(self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.assigned_ids
            .lock()
            .extend(ids.into_iter().map(str::to_string));
        self
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub(crate) fn memory(&self) -> &MemoryStore<E> {
        &self.inner
    }

    async fn enter(&self, call: StoreCall, write: bool) -> Result<(), StoreError> {
        self.calls.lock().push(call);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = if write {
            self.fail_writes.load(Ordering::SeqCst)
        } else {
            self.fail_reads.load(Ordering::SeqCst)
        };
        if failing {
            return Err(StoreError::Unavailable(format!(
                "{} is down",
                self.inner.name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> EntityStore<E> for RecordingStore<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create(&self, mut entity: E) -> Result<E, StoreError> {
        self.enter(StoreCall::Create(entity.id().map(str::to_string)), true)
            .await?;
        if entity.id().is_none() {
            let next = self.assigned_ids.lock().pop_front();
            if let Some(id) = next {
                entity.set_id(id);
            }
        }
        self.inner.create(entity).await
    }

    async fn get(&self, id: &str) -> Result<Option<E>, StoreError> {
        self.enter(StoreCall::Get(id.to_string()), false).await?;
        self.inner.get(id).await
    }

    async fn get_by_natural_key(&self, key: &E::NaturalKey) -> Result<Option<E>, StoreError> {
        self.enter(StoreCall::GetByNaturalKey(key.to_string()), false)
            .await?;
        self.inner.get_by_natural_key(key).await
    }

    async fn update(&self, entity: E) -> Result<E, StoreError> {
        let id = entity.id().unwrap_or_default().to_string();
        self.enter(StoreCall::Update(id), true).await?;
        self.inner.update(entity).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.enter(StoreCall::Delete(id.to_string()), true).await?;
        self.inner.delete(id).await
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<E>, StoreError> {
        self.enter(StoreCall::List, false).await?;
        self.inner.list(query).await
    }

    async fn batch_create(&self, entities: Vec<E>) -> Result<Vec<E>, StoreError> {
        let ids = entities
            .iter()
            .map(|e| e.id().map(str::to_string))
            .collect();
        self.enter(StoreCall::BatchCreate(ids), true).await?;
        self.inner.batch_create(entities).await
    }
}
