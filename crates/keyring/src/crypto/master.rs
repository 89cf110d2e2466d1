//! Master key derivation from a provider-supplied secret.

use common::KeyError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::entropy::fingerprint;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Shortest master secret accepted by [`MasterKey::from_provider`].
pub const MIN_SECRET_LEN: usize = 16;

/// Domain-separation label mixed into the master key derivation.
const DERIVATION_LABEL: &[u8] = b"keyring/master-key/v1";

/// Source of the master secret.
///
/// This is the only way to obtain a [`MasterKey`]: configuration loaders and
/// HSM/KMS adapters implement it, and nothing in this crate ships a default.
pub trait MasterSecretProvider {
    /// Return the raw master secret.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Configuration`] if the secret is unavailable.
    fn master_secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError>;
}

/// The symmetric key that seals every stored key envelope.
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    id: String,
}

impl MasterKey {
    /// Derive the master key from `provider`'s secret with HMAC-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Configuration`] if the provider fails or the secret
    /// is shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn from_provider(provider: &dyn MasterSecretProvider) -> Result<Self, KeyError> {
        let secret = provider.master_secret()?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(KeyError::Configuration(format!(
                "master secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&secret)
            .map_err(|_| KeyError::Configuration("master secret rejected by KDF".into()))?;
        mac.update(DERIVATION_LABEL);
        let derived = mac.finalize().into_bytes();

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&derived);
        let id = fingerprint(key.as_slice())[..16].to_owned();
        Ok(Self { key, id })
    }

    /// Short, non-secret identifier for log correlation.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.key.as_slice()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
