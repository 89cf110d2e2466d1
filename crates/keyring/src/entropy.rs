//! Secure random key generation and one-way fingerprinting.

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::KeyError;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Default key length in bytes (256 bits).
pub const DEFAULT_KEY_LEN: usize = 32;

/// Plaintext key material, base64url-encoded without padding.
///
/// The backing buffer is zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Zeroizing<String>);

impl SecretKey {
    pub(crate) fn from_encoded(encoded: String) -> Self {
        Self(Zeroizing::new(encoded))
    }

    /// The encoded key, as handed to consumers.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// The encoded key as bytes; this is what gets sealed and fingerprinted.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Generate `len_bytes` of OS entropy and encode them as a [`SecretKey`].
///
/// # Errors
///
/// Returns [`KeyError::Configuration`] if `len_bytes` is zero.
pub fn generate_secure_key(len_bytes: usize) -> Result<SecretKey, KeyError> {
    if len_bytes == 0 {
        return Err(KeyError::Configuration(
            "key length must be greater than zero".into(),
        ));
    }
    let mut raw = Zeroizing::new(vec![0u8; len_bytes]);
    OsRng.fill_bytes(&mut raw);
    Ok(SecretKey::from_encoded(URL_SAFE_NO_PAD.encode(raw.as_slice())))
}

/// Lowercase hex SHA-256 of `material`.
///
/// Used for identification and audit correlation only; never as key input.
pub fn fingerprint(material: &[u8]) -> String {
    format!("{:x}", Sha256::digest(material))
}
