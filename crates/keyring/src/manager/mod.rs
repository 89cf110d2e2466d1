//! Key lifecycle orchestration: create, rotate, look up, retire, sweep.
//!
//! # Lifecycle
//!
//! 1. [`KeyManager::create_key`] mints fresh material, seals it, and stores
//!    an Active record. The plaintext is returned to the caller once.
//! 2. [`KeyManager::rotate_key`] replaces an Active key with a successor of
//!    the same type; the old record becomes Retiring so material produced
//!    under it can still be validated.
//! 3. [`KeyManager::retire_key`] finalises a key as Retired (terminal).
//! 4. [`KeyManager::check_expired_keys`], usually driven by [`sweep_task`],
//!    rotates expired Active keys and retires expired Retiring ones.
//!
//! # Security invariants
//!
//! - Plaintext is **never** written to the store, logged, or included in
//!   traces; it lives only in the cache and in values returned to callers.
//! - The cache is invalidated only after the store write it reflects has
//!   succeeded.
//! - Read-through fills are dropped if the cache was invalidated while the
//!   store read was in flight, so a lookup racing a rotation or retirement
//!   cannot put the superseded key back.
//! - Concurrent creates for one type can leave several Active records. Reads
//!   log this as a data-integrity error and use the newest; see
//!   [`KeyManager::reconcile_active`].

mod sweep;

pub use sweep::sweep_task;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::{KeyError, KeyMetadata, KeyState, KeyType};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CachedKey, KeyCache};
use crate::crypto::EnvelopeCipher;
use crate::entropy::{fingerprint, generate_secure_key, SecretKey, DEFAULT_KEY_LEN};
use crate::store::{
    sort_newest_first, KeyRecord, KeyStore, RotateOutcome, StateChange, StoreError,
};
use crate::telemetry::KeyMetrics;

const SECS_PER_DAY: i64 = 86_400;

/// Suffix marking a rotation successor's description.
const ROTATED_FROM: &str = " (rotated from ";

/// Manager tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Lifetime (days) of a rotation successor when the old key never
    /// expired or has no lifetime left.
    pub default_rotation_days: i64,
    /// Deadline for every store call.
    pub store_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            default_rotation_days: 90,
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// The single entry point for key lifecycle operations.
///
/// Cheap to clone; clones share the store, cipher and cache.
#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    cipher: EnvelopeCipher,
    cache: KeyCache,
    metrics: KeyMetrics,
    settings: ManagerSettings,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, cipher: EnvelopeCipher, settings: ManagerSettings) -> Self {
        Self {
            store,
            cipher,
            cache: KeyCache::new(),
            metrics: KeyMetrics::new(),
            settings,
        }
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Create a new Active key of `key_type`.
    ///
    /// `ttl_days <= 0` creates a key that never expires.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Persistence`] or [`KeyError::Timeout`] if the record
    /// cannot be stored; no plaintext is returned in that case.
    pub async fn create_key(
        &self,
        key_type: KeyType,
        description: &str,
        ttl_days: i64,
    ) -> Result<(String, SecretKey), KeyError> {
        let (record, secret) = self.mint(key_type, description.to_owned(), ttl_days, 1)?;
        self.flag_reuse(&record).await;
        self.call("insert", self.store.insert(&record)).await?;

        self.cache_as_active(&record.metadata, &secret);
        self.metrics.key_created(key_type);
        info!(
            key_id = %record.metadata.id,
            key_type = %key_type,
            expires_at = ?record.metadata.expires_at,
            "key created"
        );
        Ok((record.metadata.id, secret))
    }

    /// Replace the Active key `key_id` with a fresh successor.
    ///
    /// The old record becomes Retiring in the same store operation that
    /// inserts the successor.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] if `key_id` is unknown or no longer
    /// Active, and [`KeyError::Persistence`] if the store write fails, in
    /// which case the old key remains Active.
    pub async fn rotate_key(&self, key_id: &str) -> Result<(String, SecretKey), KeyError> {
        let old = self
            .call("get", self.store.get(key_id))
            .await?
            .ok_or_else(|| KeyError::NotFound(key_id.to_owned()))?;
        let old_meta = &old.metadata;
        if old_meta.state != KeyState::Active {
            return Err(not_active(key_id, old_meta.state));
        }

        let ttl_days = self.successor_ttl_days(old_meta, Utc::now());
        let description = successor_description(&old_meta.description, key_id);
        let (record, secret) = self.mint(
            old_meta.key_type,
            description,
            ttl_days,
            old_meta.version.saturating_add(1),
        )?;
        self.flag_reuse(&record).await;

        match self.call("rotate", self.store.rotate(key_id, &record)).await? {
            RotateOutcome::Rotated => {}
            RotateOutcome::NotFound => return Err(KeyError::NotFound(key_id.to_owned())),
            RotateOutcome::NotActive(state) => return Err(not_active(key_id, state)),
        }

        self.cache.invalidate_type(old_meta.key_type);
        self.cache_as_active(&record.metadata, &secret);
        self.metrics.key_rotated(old_meta.key_type);
        self.metrics.key_created(old_meta.key_type);
        info!(
            old_key_id = %key_id,
            new_key_id = %record.metadata.id,
            key_type = %old_meta.key_type,
            version = record.metadata.version,
            "key rotated"
        );
        Ok((record.metadata.id, secret))
    }

    /// The current Active key of `key_type`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NoActiveKey`] if the type has no Active record and
    /// [`KeyError::Integrity`] if the stored envelope fails to open.
    pub async fn get_active_key(&self, key_type: KeyType) -> Result<(String, SecretKey), KeyError> {
        let slot = CacheKey::ActiveOfType(key_type);
        if let Some(hit) = self.cache.get(&slot) {
            self.metrics.cache_lookup(true);
            return Ok((hit.metadata.id, hit.secret));
        }
        self.metrics.cache_lookup(false);

        let generation = self.cache.generation();
        let mut active = self.call("find_active", self.store.find_active(key_type)).await?;
        sort_newest_first(&mut active);
        if active.len() > 1 {
            let ids: Vec<&str> = active.iter().map(KeyRecord::id).collect();
            error!(
                key_type = %key_type,
                count = active.len(),
                ids = ?ids,
                "multiple active keys for type; using the newest"
            );
        }
        let record = active
            .into_iter()
            .next()
            .ok_or_else(|| KeyError::NoActiveKey(key_type.to_string()))?;

        let secret = self.decrypt(&record)?;
        let entry = CachedKey {
            secret: secret.clone(),
            metadata: record.metadata.clone(),
        };
        let by_id = CacheKey::ById(record.metadata.id.clone());
        let filled = self.cache.put_if_unchanged(by_id, entry.clone(), generation)
            && self.cache.put_if_unchanged(slot, entry, generation);
        if !filled {
            debug!(key_type = %key_type, "cache invalidated during lookup; not caching result");
        }
        Ok((record.metadata.id, secret))
    }

    /// A key by id, in any state.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] if `key_id` is unknown.
    pub async fn get_key(&self, key_id: &str) -> Result<(SecretKey, KeyMetadata), KeyError> {
        let slot = CacheKey::ById(key_id.to_owned());
        if let Some(hit) = self.cache.get(&slot) {
            self.metrics.cache_lookup(true);
            return Ok((hit.secret, hit.metadata));
        }
        self.metrics.cache_lookup(false);

        let generation = self.cache.generation();
        let record = self
            .call("get", self.store.get(key_id))
            .await?
            .ok_or_else(|| KeyError::NotFound(key_id.to_owned()))?;
        let secret = self.decrypt(&record)?;
        let entry = CachedKey {
            secret: secret.clone(),
            metadata: record.metadata.clone(),
        };
        if !self.cache.put_if_unchanged(slot, entry, generation) {
            debug!(key_id = %key_id, "cache invalidated during lookup; not caching result");
        }
        Ok((secret, record.metadata))
    }

    /// Mark `key_id` Retired. Retiring a Retired key succeeds without a write.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] if `key_id` is unknown and
    /// [`KeyError::Persistence`] if the store write fails; the cache is left
    /// untouched in both cases.
    pub async fn retire_key(&self, key_id: &str) -> Result<(), KeyError> {
        let record = self
            .call("get", self.store.get(key_id))
            .await?
            .ok_or_else(|| KeyError::NotFound(key_id.to_owned()))?;
        let key_type = record.metadata.key_type;

        if record.metadata.state == KeyState::Retired {
            debug!(key_id = %key_id, "key already retired");
        } else {
            let updated = self
                .call("update_state", self.store.update_state(key_id, KeyState::Retired))
                .await?;
            if !updated {
                return Err(KeyError::NotFound(key_id.to_owned()));
            }
            self.metrics.key_retired(key_type);
            info!(
                key_id = %key_id,
                key_type = %key_type,
                previous_state = %record.metadata.state,
                "key retired"
            );
        }

        self.cache.invalidate(&CacheKey::ById(key_id.to_owned()));
        self.cache.invalidate(&CacheKey::ActiveOfType(key_type));
        Ok(())
    }

    /// Metadata of every stored key, newest first.
    pub async fn list_keys(&self) -> Result<Vec<KeyMetadata>, KeyError> {
        let records = self.call("list", self.store.list()).await?;
        Ok(records.into_iter().map(|r| r.metadata).collect())
    }

    /// Demote all but the newest Active record of `key_type` to Retiring.
    ///
    /// Returns the ids that were demoted. A record that left Active after
    /// the scan (retired or rotated meanwhile) is left as it is.
    pub async fn reconcile_active(&self, key_type: KeyType) -> Result<Vec<String>, KeyError> {
        let mut active = self.call("find_active", self.store.find_active(key_type)).await?;
        if active.len() <= 1 {
            return Ok(Vec::new());
        }
        sort_newest_first(&mut active);

        let mut demoted = Vec::with_capacity(active.len() - 1);
        for record in active.iter().skip(1) {
            let change = self
                .call(
                    "transition",
                    self.store
                        .transition(record.id(), KeyState::Active, KeyState::Retiring),
                )
                .await?;
            match change {
                StateChange::Applied => demoted.push(record.metadata.id.clone()),
                StateChange::NotFound | StateChange::Mismatch(_) => {
                    debug!(
                        key_id = %record.id(),
                        outcome = ?change,
                        "key no longer active; not demoted"
                    );
                }
            }
        }

        self.cache.invalidate_type(key_type);
        warn!(
            key_type = %key_type,
            kept = %active[0].metadata.id,
            demoted = ?demoted,
            "reconciled multiple active keys"
        );
        Ok(demoted)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Generate, fingerprint and seal a new Active record.
    fn mint(
        &self,
        key_type: KeyType,
        description: String,
        ttl_days: i64,
        version: u32,
    ) -> Result<(KeyRecord, SecretKey), KeyError> {
        let secret = generate_secure_key(DEFAULT_KEY_LEN)?;
        let created_at = Utc::now();
        let expires_at = expiry(created_at, ttl_days)?;
        let encrypted_key = self.cipher.seal(secret.as_bytes())?;

        let record = KeyRecord {
            metadata: KeyMetadata {
                id: uuid::Uuid::new_v4().to_string(),
                key_type,
                version,
                fingerprint: fingerprint(secret.as_bytes()),
                created_at,
                expires_at,
                state: KeyState::Active,
                description,
            },
            encrypted_key,
        };
        Ok((record, secret))
    }

    /// Open a record's envelope and check it against the stored fingerprint.
    fn decrypt(&self, record: &KeyRecord) -> Result<SecretKey, KeyError> {
        let plaintext = self.cipher.open(&record.encrypted_key).map_err(|e| {
            error!(key_id = %record.metadata.id, error = %e, "stored envelope failed to open");
            KeyError::from(e)
        })?;
        if fingerprint(&plaintext) != record.metadata.fingerprint {
            error!(key_id = %record.metadata.id, "decrypted key does not match its fingerprint");
            return Err(KeyError::Integrity(format!(
                "fingerprint mismatch for key {}",
                record.metadata.id
            )));
        }
        let encoded = String::from_utf8(plaintext.to_vec())
            .map_err(|_| KeyError::Integrity(format!("key {} is not valid UTF-8", record.metadata.id)))?;
        Ok(SecretKey::from_encoded(encoded))
    }

    /// Log when the new material's fingerprint is already on record.
    ///
    /// Advisory only: a failed lookup is logged and creation proceeds.
    async fn flag_reuse(&self, record: &KeyRecord) {
        match self
            .call(
                "find_by_fingerprint",
                self.store.find_by_fingerprint(&record.metadata.fingerprint),
            )
            .await
        {
            Ok(existing) if !existing.is_empty() => {
                let ids: Vec<&str> = existing.iter().map(KeyRecord::id).collect();
                warn!(
                    key_id = %record.metadata.id,
                    fingerprint = %record.metadata.fingerprint,
                    existing = ?ids,
                    "key material reuse detected"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "fingerprint reuse check failed"),
        }
    }

    fn cache_as_active(&self, metadata: &KeyMetadata, secret: &SecretKey) {
        let entry = CachedKey {
            secret: secret.clone(),
            metadata: metadata.clone(),
        };
        self.cache
            .put(CacheKey::ById(metadata.id.clone()), entry.clone());
        self.cache
            .put(CacheKey::ActiveOfType(metadata.key_type), entry);
    }

    /// Whole days left on `old`, rounded up, or the default window when none
    /// are left.
    fn successor_ttl_days(&self, old: &KeyMetadata, now: DateTime<Utc>) -> i64 {
        match old.expires_at {
            Some(expires_at) if expires_at > now => {
                let secs = (expires_at - now).num_seconds();
                (secs + SECS_PER_DAY - 1) / SECS_PER_DAY
            }
            _ => self.settings.default_rotation_days,
        }
    }

    /// Run a store call under the configured deadline.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, KeyError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match time::timeout(self.settings.store_timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                warn!(op, error = %e, "store call failed");
                KeyError::from(e)
            }),
            Err(_) => {
                warn!(op, timeout = ?self.settings.store_timeout, "store call timed out");
                Err(KeyError::Timeout(op.to_owned()))
            }
        }
    }
}

/// `"<base> (rotated from <id>)"`, where `base` drops any earlier rotation
/// suffix so the description stays the same length across a lineage.
fn successor_description(description: &str, key_id: &str) -> String {
    let base = description
        .split_once(ROTATED_FROM)
        .map_or(description, |(base, _)| base);
    format!("{base}{ROTATED_FROM}{key_id})")
}

fn not_active(key_id: &str, state: KeyState) -> KeyError {
    KeyError::NotFound(format!("{key_id} is {state}, not active"))
}

fn expiry(created_at: DateTime<Utc>, ttl_days: i64) -> Result<Option<DateTime<Utc>>, KeyError> {
    if ttl_days <= 0 {
        return Ok(None);
    }
    TimeDelta::try_days(ttl_days)
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .map(Some)
        .ok_or_else(|| KeyError::Configuration(format!("ttl of {ttl_days} days is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use crate::store::{MemoryKeyStore, MockKeyStore};
    use mockall::predicate;
    use crate::testutil::{master_key, record, CountingStore};

    fn manager_with(store: Arc<dyn KeyStore>) -> KeyManager {
        KeyManager::new(
            store,
            EnvelopeCipher::new(master_key()),
            ManagerSettings::default(),
        )
    }

    fn counting_manager() -> (KeyManager, CountingStore) {
        let store = CountingStore::new();
        (manager_with(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn create_then_get_active_returns_same_plaintext() {
        let (manager, store) = counting_manager();
        let (id, secret) = manager
            .create_key(KeyType::Encryption, "primary data key", 90)
            .await
            .unwrap();

        let (active_id, active) = manager.get_active_key(KeyType::Encryption).await.unwrap();
        assert_eq!(active_id, id);
        assert_eq!(active, secret);

        let rec = store.inner.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.metadata.state, KeyState::Active);
        assert_eq!(rec.metadata.version, 1);
        assert!(!rec.metadata.is_expired_at(Utc::now()));
        let expires_at = rec.metadata.expires_at.unwrap();
        let days = (expires_at - rec.metadata.created_at).num_days();
        assert_eq!(days, 90);
    }

    #[tokio::test]
    async fn plaintext_is_not_stored() {
        let (manager, store) = counting_manager();
        let (id, secret) = manager.create_key(KeyType::ApiKey, "client", 30).await.unwrap();
        let rec = store.inner.get(&id).await.unwrap().unwrap();
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains(secret.expose()));
        assert_eq!(rec.metadata.fingerprint, fingerprint(secret.as_bytes()));
    }

    #[tokio::test]
    async fn non_positive_ttl_never_expires() {
        let (manager, store) = counting_manager();
        for ttl in [0, -5] {
            let (id, _) = manager.create_key(KeyType::Webhook, "hook", ttl).await.unwrap();
            let rec = store.inner.get(&id).await.unwrap().unwrap();
            assert!(rec.metadata.expires_at.is_none());
        }
    }

    #[tokio::test]
    async fn create_fails_with_persistence_error() {
        let mut store = MockKeyStore::new();
        store.expect_find_by_fingerprint().returning(|_| Ok(Vec::new()));
        store
            .expect_insert()
            .returning(|_| Err(StoreError::Unavailable("db down".into())));
        let manager = manager_with(Arc::new(store));

        let err = manager
            .create_key(KeyType::Signing, "jwt", 30)
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::Persistence(_)));
        assert!(manager.cache().is_empty());
    }

    #[tokio::test]
    async fn second_active_lookup_is_served_from_cache() {
        let (manager, store) = counting_manager();
        let (id, secret) = manager.create_key(KeyType::Signing, "jwt", 30).await.unwrap();
        manager.cache().clear();

        let first = manager.get_active_key(KeyType::Signing).await.unwrap();
        let calls_after_first = store.calls();
        let second = manager.get_active_key(KeyType::Signing).await.unwrap();

        assert_eq!(store.calls(), calls_after_first);
        assert_eq!(first, second);
        assert_eq!(second, (id, secret));
    }

    #[tokio::test]
    async fn rotate_retires_old_and_activates_new() {
        let (manager, store) = counting_manager();
        let (old_id, old_secret) = manager.create_key(KeyType::Webhook, "hook", 90).await.unwrap();
        manager.get_active_key(KeyType::Webhook).await.unwrap();

        let (new_id, new_secret) = manager.rotate_key(&old_id).await.unwrap();
        assert_ne!(new_id, old_id);
        assert_ne!(new_secret, old_secret);

        let old = store.inner.get(&old_id).await.unwrap().unwrap();
        assert_eq!(old.metadata.state, KeyState::Retiring);
        let new = store.inner.get(&new_id).await.unwrap().unwrap();
        assert_eq!(new.metadata.state, KeyState::Active);
        assert_eq!(new.metadata.key_type, KeyType::Webhook);
        assert_eq!(new.metadata.version, 2);
        assert!(new.metadata.description.contains(&old_id));

        let (active_id, active) = manager.get_active_key(KeyType::Webhook).await.unwrap();
        assert_eq!(active_id, new_id);
        assert_eq!(active, new_secret);

        // The retiring key stays readable for validating older material.
        let (secret, meta) = manager.get_key(&old_id).await.unwrap();
        assert_eq!(secret, old_secret);
        assert_eq!(meta.state, KeyState::Retiring);
    }

    #[tokio::test]
    async fn repeated_rotation_keeps_description_bounded() {
        let (manager, store) = counting_manager();
        let (first, _) = manager.create_key(KeyType::Signing, "jwt signer", 30).await.unwrap();
        let (second, _) = manager.rotate_key(&first).await.unwrap();
        let (third, _) = manager.rotate_key(&second).await.unwrap();

        let rec = store.inner.get(&third).await.unwrap().unwrap();
        assert_eq!(rec.metadata.description, format!("jwt signer (rotated from {second})"));
        assert_eq!(rec.metadata.version, 3);
    }

    #[test]
    fn successor_description_replaces_earlier_suffix() {
        assert_eq!(successor_description("hook", "a"), "hook (rotated from a)");
        assert_eq!(
            successor_description("hook (rotated from a)", "b"),
            "hook (rotated from b)"
        );
    }

    #[tokio::test]
    async fn rotate_keeps_remaining_lifetime() {
        let (manager, store) = counting_manager();
        let (old_id, _) = manager.create_key(KeyType::ApiKey, "client", 10).await.unwrap();
        let (new_id, _) = manager.rotate_key(&old_id).await.unwrap();
        let new = store.inner.get(&new_id).await.unwrap().unwrap();
        let days = (new.metadata.expires_at.unwrap() - new.metadata.created_at).num_days();
        assert!((9..=10).contains(&days), "got {days}");
    }

    #[tokio::test]
    async fn rotate_of_never_expiring_key_uses_default_window() {
        let (manager, store) = counting_manager();
        let (old_id, _) = manager.create_key(KeyType::ApiKey, "client", 0).await.unwrap();
        let (new_id, _) = manager.rotate_key(&old_id).await.unwrap();
        let new = store.inner.get(&new_id).await.unwrap().unwrap();
        let days = (new.metadata.expires_at.unwrap() - new.metadata.created_at).num_days();
        assert_eq!(days, ManagerSettings::default().default_rotation_days);
    }

    #[tokio::test]
    async fn rotate_unknown_or_inactive_is_not_found() {
        let (manager, _) = counting_manager();
        assert!(matches!(
            manager.rotate_key("missing").await,
            Err(KeyError::NotFound(_))
        ));

        let (id, _) = manager.create_key(KeyType::Signing, "jwt", 30).await.unwrap();
        manager.retire_key(&id).await.unwrap();
        assert!(matches!(
            manager.rotate_key(&id).await,
            Err(KeyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_rotation_leaves_old_key_active() {
        let (manager, store) = counting_manager();
        let (old_id, old_secret) = manager.create_key(KeyType::Encryption, "dek", 30).await.unwrap();
        store.fail_writes_for(&old_id);

        let err = manager.rotate_key(&old_id).await.unwrap_err();
        assert!(matches!(err, KeyError::Persistence(_)));

        let active = store.inner.find_active(KeyType::Encryption).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), old_id);
        assert_eq!(store.inner.len().await, 1);

        manager.cache().clear();
        let (id, secret) = manager.get_active_key(KeyType::Encryption).await.unwrap();
        assert_eq!((id, secret), (old_id, old_secret));
    }

    #[tokio::test]
    async fn get_active_without_keys_is_no_active_key() {
        let (manager, _) = counting_manager();
        let err = manager.get_active_key(KeyType::ApiKey).await.unwrap_err();
        assert!(matches!(err, KeyError::NoActiveKey(ref t) if t == "api_key"));
    }

    #[tokio::test]
    async fn get_key_unknown_is_not_found() {
        let (manager, _) = counting_manager();
        assert!(matches!(
            manager.get_key("nope").await,
            Err(KeyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_key_is_cached_after_first_read() {
        let (manager, store) = counting_manager();
        let (id, secret) = manager.create_key(KeyType::Signing, "jwt", 30).await.unwrap();
        manager.cache().clear();

        let (first, meta) = manager.get_key(&id).await.unwrap();
        let calls = store.calls();
        let (second, _) = manager.get_key(&id).await.unwrap();
        assert_eq!(store.calls(), calls);
        assert_eq!(first, secret);
        assert_eq!(second, secret);
        assert_eq!(meta.id, id);
    }

    #[tokio::test]
    async fn retire_is_idempotent() {
        let (manager, store) = counting_manager();
        let (id, _) = manager.create_key(KeyType::Webhook, "hook", 30).await.unwrap();

        manager.retire_key(&id).await.unwrap();
        manager.retire_key(&id).await.unwrap();

        let rec = store.inner.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.metadata.state, KeyState::Retired);
        assert!(manager.cache().get(&CacheKey::ById(id.clone())).is_none());
        assert!(matches!(
            manager.get_active_key(KeyType::Webhook).await,
            Err(KeyError::NoActiveKey(_))
        ));
    }

    #[tokio::test]
    async fn retire_unknown_is_not_found() {
        let (manager, _) = counting_manager();
        assert!(matches!(
            manager.retire_key("ghost").await,
            Err(KeyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_retire_keeps_cache() {
        let (manager, store) = counting_manager();
        let (id, _) = manager.create_key(KeyType::Signing, "jwt", 30).await.unwrap();
        store.fail_writes_for(&id);

        let err = manager.retire_key(&id).await.unwrap_err();
        assert!(matches!(err, KeyError::Persistence(_)));
        assert!(manager.cache().get(&CacheKey::ById(id.clone())).is_some());
        assert!(manager
            .cache()
            .get(&CacheKey::ActiveOfType(KeyType::Signing))
            .is_some());
    }

    #[tokio::test]
    async fn tampered_envelope_is_integrity_error() {
        let store = MemoryKeyStore::new();
        let manager = manager_with(Arc::new(store.clone()));
        let (id, _) = manager.create_key(KeyType::Encryption, "dek", 30).await.unwrap();
        manager.cache().clear();

        let mut rec = store.get(&id).await.unwrap().unwrap();
        let mut fields: Vec<String> = rec.encrypted_key.split(':').map(str::to_owned).collect();
        let mut tag = STANDARD.decode(&fields[1]).unwrap();
        tag[0] ^= 0x01;
        fields[1] = STANDARD.encode(tag);
        rec.encrypted_key = fields.join(":");

        // Swap the genuine record for the tampered copy.
        store.update_state(&id, KeyState::Retired).await.unwrap();
        let tampered_id = "tampered";
        rec.metadata.id = tampered_id.into();
        store.insert(&rec).await.unwrap();

        assert!(matches!(
            manager.get_key(tampered_id).await,
            Err(KeyError::Integrity(_))
        ));
        assert!(matches!(
            manager.get_active_key(KeyType::Encryption).await,
            Err(KeyError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_integrity_error() {
        let store = MemoryKeyStore::new();
        let manager = manager_with(Arc::new(store.clone()));
        let (id, _) = manager.create_key(KeyType::ApiKey, "client", 30).await.unwrap();
        manager.cache().clear();

        let mut rec = store.get(&id).await.unwrap().unwrap();
        rec.metadata.id = "forged".into();
        rec.metadata.fingerprint = "00".repeat(32);
        store.insert(&rec).await.unwrap();

        assert!(matches!(
            manager.get_key("forged").await,
            Err(KeyError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn newest_active_wins_when_several_exist() {
        let (manager, store) = counting_manager();
        let (older, _) = manager.create_key(KeyType::Signing, "a", 30).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (newer, newer_secret) = manager.create_key(KeyType::Signing, "b", 30).await.unwrap();
        manager.cache().clear();

        let (id, secret) = manager.get_active_key(KeyType::Signing).await.unwrap();
        assert_eq!(id, newer);
        assert_eq!(secret, newer_secret);

        let demoted = manager.reconcile_active(KeyType::Signing).await.unwrap();
        assert_eq!(demoted, vec![older.clone()]);
        let rec = store.inner.get(&older).await.unwrap().unwrap();
        assert_eq!(rec.metadata.state, KeyState::Retiring);
        assert!(manager.reconcile_active(KeyType::Signing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_racing_rotation_does_not_cache_old_key() {
        let store = CountingStore::with_find_active_lag(Duration::from_millis(100));
        let manager = manager_with(Arc::new(store.clone()));
        let (old_id, _) = manager.create_key(KeyType::Signing, "jwt", 30).await.unwrap();
        manager.cache().clear();

        let lookup = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_active_key(KeyType::Signing).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (new_id, new_secret) = manager.rotate_key(&old_id).await.unwrap();

        // The in-flight lookup answers from its own read...
        let (seen, _) = lookup.await.unwrap().unwrap();
        assert_eq!(seen, old_id);
        // ...but must not leave that answer in the cache.
        let (id, secret) = manager.get_active_key(KeyType::Signing).await.unwrap();
        assert_eq!(id, new_id);
        assert_eq!(secret, new_secret);
        let old = store.inner.get(&old_id).await.unwrap().unwrap();
        assert_eq!(old.metadata.state, KeyState::Retiring);
    }

    #[tokio::test]
    async fn lookup_racing_retire_does_not_cache_retired_key() {
        let store = CountingStore::with_find_active_lag(Duration::from_millis(100));
        let manager = manager_with(Arc::new(store.clone()));
        let (id, _) = manager.create_key(KeyType::Webhook, "hook", 30).await.unwrap();
        manager.cache().clear();

        let lookup = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_active_key(KeyType::Webhook).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.retire_key(&id).await.unwrap();
        lookup.await.unwrap().unwrap();

        assert!(manager.cache().get(&CacheKey::ActiveOfType(KeyType::Webhook)).is_none());
        assert!(manager.cache().get(&CacheKey::ById(id)).is_none());
        assert!(matches!(
            manager.get_active_key(KeyType::Webhook).await,
            Err(KeyError::NoActiveKey(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_leaves_keys_that_left_active_alone() {
        let mut older = record("older", KeyType::Signing, KeyState::Active);
        older.metadata.created_at -= TimeDelta::hours(1);
        let newer = record("newer", KeyType::Signing, KeyState::Active);
        let snapshot = vec![newer, older];

        let mut store = MockKeyStore::new();
        store
            .expect_find_active()
            .returning(move |_| Ok(snapshot.clone()));
        // Retired by someone else between the scan and the demotion.
        store
            .expect_transition()
            .with(
                predicate::eq("older"),
                predicate::eq(KeyState::Active),
                predicate::eq(KeyState::Retiring),
            )
            .times(1)
            .returning(|_, _, _| Ok(StateChange::Mismatch(KeyState::Retired)));
        store.expect_update_state().never();
        let manager = manager_with(Arc::new(store));

        let demoted = manager.reconcile_active(KeyType::Signing).await.unwrap();
        assert!(demoted.is_empty());
    }

    #[tokio::test]
    async fn list_keys_returns_metadata_newest_first() {
        let (manager, _) = counting_manager();
        let (a, _) = manager.create_key(KeyType::Encryption, "a", 30).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (b, _) = manager.create_key(KeyType::Webhook, "b", 30).await.unwrap();

        let keys = manager.list_keys().await.unwrap();
        let ids: Vec<&str> = keys.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, [b.as_str(), a.as_str()]);
    }

    #[tokio::test]
    async fn slow_store_times_out_with_retryable_error() {
        let store = CountingStore::with_delay(Duration::from_millis(200));
        let manager = KeyManager::new(
            Arc::new(store),
            EnvelopeCipher::new(master_key()),
            ManagerSettings {
                store_timeout: Duration::from_millis(20),
                ..ManagerSettings::default()
            },
        );
        let err = manager.get_active_key(KeyType::Encryption).await.unwrap_err();
        assert!(matches!(err, KeyError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn expiry_rejects_overflowing_ttl() {
        assert!(expiry(Utc::now(), i64::MAX).is_err());
        assert!(expiry(Utc::now(), 0).unwrap().is_none());
    }
}
