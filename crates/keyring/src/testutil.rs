//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KeyError, KeyMetadata, KeyState, KeyType};
use zeroize::Zeroizing;

use crate::crypto::{MasterKey, MasterSecretProvider};
use crate::entropy::fingerprint;
use crate::store::{KeyRecord, KeyStore, MemoryKeyStore, RotateOutcome, StateChange, StoreError};

/// Provider that hands out a fixed secret.
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(secret: &str) -> Self {
        Self(secret.to_owned())
    }
}

impl MasterSecretProvider for StaticSecret {
    fn master_secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        Ok(Zeroizing::new(self.0.as_bytes().to_vec()))
    }
}

/// Master key derived from a fixed test secret.
pub fn master_key() -> MasterKey {
    MasterKey::from_provider(&StaticSecret::new("unit-test-master-secret-0001"))
        .expect("test secret is long enough")
}

/// A record with a placeholder envelope, created now, never expiring.
pub fn record(id: &str, key_type: KeyType, state: KeyState) -> KeyRecord {
    KeyRecord {
        metadata: KeyMetadata {
            id: id.to_owned(),
            key_type,
            version: 1,
            fingerprint: fingerprint(id.as_bytes()),
            created_at: Utc::now(),
            expires_at: None,
            state,
            description: format!("test key {id}"),
        },
        encrypted_key: "AAAAAAAAAAAAAAAA:AAAAAAAAAAAAAAAAAAAAAA==:AAAA".into(),
    }
}

/// [`MemoryKeyStore`] wrapper that counts calls, can delay every call, can
/// hold `find_active` results back after taking them, and can fail writes
/// touching selected ids.
#[derive(Clone, Default)]
pub struct CountingStore {
    pub inner: MemoryKeyStore,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
    find_active_lag: Option<Duration>,
    failing_ids: Arc<Mutex<HashSet<String>>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Sleep for `lag` after each `find_active` has read the store, so its
    /// result is already stale when it reaches the caller.
    pub fn with_find_active_lag(lag: Duration) -> Self {
        Self {
            find_active_lag: Some(lag),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every write that touches `id` fail.
    pub fn fail_writes_for(&self, id: &str) {
        self.failing_ids
            .lock()
            .expect("lock poisoned")
            .insert(id.to_owned());
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_writable(&self, id: &str) -> Result<(), StoreError> {
        if self.failing_ids.lock().expect("lock poisoned").contains(id) {
            return Err(StoreError::Unavailable(format!("injected failure for {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for CountingStore {
    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        self.enter().await;
        self.check_writable(record.id())?;
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.enter().await;
        self.inner.get(id).await
    }

    async fn find_active(&self, key_type: KeyType) -> Result<Vec<KeyRecord>, StoreError> {
        self.enter().await;
        let snapshot = self.inner.find_active(key_type).await;
        if let Some(lag) = self.find_active_lag {
            tokio::time::sleep(lag).await;
        }
        snapshot
    }

    async fn update_state(&self, id: &str, state: KeyState) -> Result<bool, StoreError> {
        self.enter().await;
        self.check_writable(id)?;
        self.inner.update_state(id, state).await
    }

    async fn transition(
        &self,
        id: &str,
        from: KeyState,
        to: KeyState,
    ) -> Result<StateChange, StoreError> {
        self.enter().await;
        self.check_writable(id)?;
        self.inner.transition(id, from, to).await
    }

    async fn rotate(
        &self,
        old_id: &str,
        successor: &KeyRecord,
    ) -> Result<RotateOutcome, StoreError> {
        self.enter().await;
        self.check_writable(old_id)?;
        self.inner.rotate(old_id, successor).await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<KeyRecord>, StoreError> {
        self.enter().await;
        self.inner.list_expired(now).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<KeyRecord>, StoreError> {
        self.enter().await;
        self.inner.find_by_fingerprint(fingerprint).await
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, StoreError> {
        self.enter().await;
        self.inner.list().await
    }
}
