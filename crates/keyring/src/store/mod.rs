//! Persistence of key records.
//!
//! # Responsibilities
//!
//! - Define [`KeyRecord`], the persisted unit, whose JSON form matches the
//!   logical store columns (`id`, `key_type`, `fingerprint`, `encrypted_key`,
//!   `version`, `created_at`, `expires_at`, `state`, `description`).
//! - Define the [`KeyStore`] trait the manager talks to.
//! - Provide an in-memory backend ([`MemoryKeyStore`]) and a directory of
//!   JSON files ([`FileKeyStore`]).
//!
//! # Module invariants
//!
//! - **No crypto dependencies.** Stores only ever see envelopes, never
//!   plaintext, and must not import anything from `crate::crypto`.
//! - Records are never deleted; only `state` changes after insertion.

pub mod file;
pub mod memory;

pub use file::FileKeyStore;
pub use memory::MemoryKeyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KeyError, KeyMetadata, KeyState, KeyType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored key: metadata plus the sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(flatten)]
    pub metadata: KeyMetadata,
    /// Serialised envelope; opaque to everything except the cipher.
    pub encrypted_key: String,
}

impl KeyRecord {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Result of [`KeyStore::rotate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The old record is now Retiring and the successor is stored.
    Rotated,
    /// No record has the given id; nothing was written.
    NotFound,
    /// The old record is not Active; nothing was written.
    NotActive(KeyState),
}

/// Result of [`KeyStore::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The record was in the expected state and now has the new one.
    Applied,
    /// No record has the given id.
    NotFound,
    /// The record was in a different state; nothing was written.
    Mismatch(KeyState),
}

/// Errors produced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this id already exists.
    #[error("duplicate key id: {0}")]
    Duplicate(String),

    /// The backend could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialisation failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for KeyError {
    fn from(e: StoreError) -> Self {
        KeyError::Persistence(e.to_string())
    }
}

/// Persistence interface for key records.
///
/// Implementations must provide at least read-committed consistency; the
/// manager does no locking of its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the id is already taken.
    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError>;

    /// Fetch a record by id regardless of state.
    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError>;

    /// All Active records of `key_type`, newest `created_at` first.
    ///
    /// More than one result is a data-integrity problem the caller resolves.
    async fn find_active(&self, key_type: KeyType) -> Result<Vec<KeyRecord>, StoreError>;

    /// Set the state of a record. Returns `false` if the id is unknown.
    async fn update_state(&self, id: &str, state: KeyState) -> Result<bool, StoreError>;

    /// Move `id` from `from` to `to`, but only if it is still in `from`.
    async fn transition(
        &self,
        id: &str,
        from: KeyState,
        to: KeyState,
    ) -> Result<StateChange, StoreError>;

    /// Mark `old_id` Retiring and insert `successor` as one operation.
    ///
    /// Nothing is written unless the old record exists and is Active.
    async fn rotate(&self, old_id: &str, successor: &KeyRecord)
        -> Result<RotateOutcome, StoreError>;

    /// Non-Retired records whose `expires_at` is strictly before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<KeyRecord>, StoreError>;

    /// Records sharing `fingerprint`, in any state.
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<KeyRecord>, StoreError>;

    /// Every record, newest first.
    async fn list(&self) -> Result<Vec<KeyRecord>, StoreError>;
}

/// Sort newest `created_at` first; ties broken by id for a stable order.
pub(crate) fn sort_newest_first(records: &mut [KeyRecord]) {
    records.sort_by(|a, b| {
        b.metadata
            .created_at
            .cmp(&a.metadata.created_at)
            .then_with(|| b.metadata.id.cmp(&a.metadata.id))
    });
}

pub(crate) fn is_expired(record: &KeyRecord, now: DateTime<Utc>) -> bool {
    record.metadata.state != KeyState::Retired && record.metadata.is_expired_at(now)
}
