//! `keyring`: lifecycle management for application key material.
//!
//! Keys (encryption keys, signing secrets, API keys, webhook secrets) are
//! generated here, sealed under a master key, persisted through a
//! [`KeyStore`], cached in memory, and rotated or retired as they expire.
//! Callers talk to [`KeyManager`]; [`generate_secure_key`] and
//! [`fingerprint`] are also usable on their own.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod entropy;
pub mod manager;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testutil;

pub use cache::{CacheKey, CachedKey, KeyCache};
pub use common::{KeyError, KeyMetadata, KeyState, KeyType};
pub use crypto::{EnvelopeCipher, MasterKey, MasterSecretProvider};
pub use entropy::{fingerprint, generate_secure_key, SecretKey, DEFAULT_KEY_LEN};
pub use manager::{sweep_task, KeyManager, ManagerSettings};
pub use store::{
    FileKeyStore, KeyRecord, KeyStore, MemoryKeyStore, RotateOutcome, StateChange, StoreError,
};
