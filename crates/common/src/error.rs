//! Common error types shared across crates.

use thiserror::Error;

/// Top-level error returned by every public key lifecycle operation.
///
/// Variants map to stable machine-readable codes via [`KeyError::code`]:
/// - [`KeyError::NotFound`] → `not_found`
/// - [`KeyError::NoActiveKey`] → `no_active_key`
/// - [`KeyError::Integrity`] → `integrity`
/// - [`KeyError::Persistence`] → `persistence`
/// - [`KeyError::Configuration`] → `configuration`
/// - [`KeyError::Timeout`] → `timeout`
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key id is unknown to the store, or the key is not in a state the
    /// operation accepts.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The key type has zero Active records.
    #[error("no active key for type {0}")]
    NoActiveKey(String),

    /// An envelope failed authentication or could not be parsed.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// A store read or write failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The master secret or other startup configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A store call did not complete within its deadline.
    #[error("store call timed out: {0}")]
    Timeout(String),
}

impl KeyError {
    /// Returns the machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            KeyError::NotFound(_) => "not_found",
            KeyError::NoActiveKey(_) => "no_active_key",
            KeyError::Integrity(_) => "integrity",
            KeyError::Persistence(_) => "persistence",
            KeyError::Configuration(_) => "configuration",
            KeyError::Timeout(_) => "timeout",
        }
    }

    /// Returns `true` if the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyError::Timeout(_))
    }
}
