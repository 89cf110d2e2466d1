//! [`MemoryKeyStore`]: process-local key store for tests and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KeyState, KeyType};
use tokio::sync::RwLock;

use super::{
    is_expired, sort_newest_first, KeyRecord, KeyStore, RotateOutcome, StateChange, StoreError,
};

/// Key store backed by a `HashMap` behind an async `RwLock`.
///
/// Every trait method holds the lock for its whole duration, so
/// [`KeyStore::rotate`] is atomic with respect to all other calls.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<HashMap<String, KeyRecord>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn collect<F>(&self, mut keep: F) -> Vec<KeyRecord>
    where
        F: FnMut(&KeyRecord) -> bool,
    {
        let mut out: Vec<KeyRecord> = self
            .inner
            .read()
            .await
            .values()
            .filter(|r| keep(*r))
            .cloned()
            .collect();
        sort_newest_first(&mut out);
        out
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        if map.contains_key(record.id()) {
            return Err(StoreError::Duplicate(record.id().to_owned()));
        }
        map.insert(record.id().to_owned(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn find_active(&self, key_type: KeyType) -> Result<Vec<KeyRecord>, StoreError> {
        Ok(self
            .collect(|r| r.metadata.key_type == key_type && r.metadata.state == KeyState::Active)
            .await)
    }

    async fn update_state(&self, id: &str, state: KeyState) -> Result<bool, StoreError> {
        let mut map = self.inner.write().await;
        match map.get_mut(id) {
            Some(rec) => {
                rec.metadata.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition(
        &self,
        id: &str,
        from: KeyState,
        to: KeyState,
    ) -> Result<StateChange, StoreError> {
        let mut map = self.inner.write().await;
        let Some(rec) = map.get_mut(id) else {
            return Ok(StateChange::NotFound);
        };
        if rec.metadata.state != from {
            return Ok(StateChange::Mismatch(rec.metadata.state));
        }
        rec.metadata.state = to;
        Ok(StateChange::Applied)
    }

    async fn rotate(
        &self,
        old_id: &str,
        successor: &KeyRecord,
    ) -> Result<RotateOutcome, StoreError> {
        let mut map = self.inner.write().await;
        if map.contains_key(successor.id()) {
            return Err(StoreError::Duplicate(successor.id().to_owned()));
        }
        let Some(old) = map.get_mut(old_id) else {
            return Ok(RotateOutcome::NotFound);
        };
        if old.metadata.state != KeyState::Active {
            return Ok(RotateOutcome::NotActive(old.metadata.state));
        }
        old.metadata.state = KeyState::Retiring;
        map.insert(successor.id().to_owned(), successor.clone());
        Ok(RotateOutcome::Rotated)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<KeyRecord>, StoreError> {
        Ok(self.collect(|r| is_expired(r, now)).await)
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<KeyRecord>, StoreError> {
        Ok(self
            .collect(|r| r.metadata.fingerprint == fingerprint)
            .await)
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, StoreError> {
        Ok(self.collect(|_| true).await)
    }
}
