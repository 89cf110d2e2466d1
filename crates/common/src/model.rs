//! Key metadata types exchanged between the lifecycle manager and its callers.
//!
//! These types never carry plaintext or encrypted key material. They are
//! serialised as JSON by the store backends and by any audit consumers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Key type
// ---------------------------------------------------------------------------

/// Closed set of key purposes managed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Symmetric data encryption key.
    Encryption,
    /// JWT / request signing secret.
    Signing,
    /// API key handed to a client.
    ApiKey,
    /// Shared secret for webhook payload signatures.
    Webhook,
}

impl KeyType {
    /// All key types, in declaration order.
    pub const ALL: [KeyType; 4] = [
        KeyType::Encryption,
        KeyType::Signing,
        KeyType::ApiKey,
        KeyType::Webhook,
    ];

    /// The storage representation of this key type.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Encryption => "encryption",
            KeyType::Signing => "signing",
            KeyType::ApiKey => "api_key",
            KeyType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown key type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Key state
// ---------------------------------------------------------------------------

/// Lifecycle state of a stored key.
///
/// ```text
/// Active ──rotate──▶ Retiring ──retire──▶ Retired
///    └─────────────retire──────────────────▲
/// ```
///
/// `Retired` is terminal; nothing transitions back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    /// The key is the current key for its type.
    Active,
    /// The key has been superseded but may still validate older material.
    Retiring,
    /// The key is kept for audit only.
    Retired,
}

impl KeyState {
    /// The storage representation of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Retiring => "retiring",
            KeyState::Retired => "retired",
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Everything known about a stored key except its material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Opaque unique identifier assigned at creation.
    pub id: String,
    /// Purpose of the key.
    pub key_type: KeyType,
    /// Position in the key's rotation lineage, starting at 1.
    pub version: u32,
    /// Hex SHA-256 of the plaintext key, for audit correlation.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// Absolute expiry; `None` means the key never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub state: KeyState,
    /// Free-text audit label.
    pub description: String,
}

impl KeyMetadata {
    /// Returns `true` if the key has an expiry strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}
