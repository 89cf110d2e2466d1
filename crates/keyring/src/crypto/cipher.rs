//! AES-256-GCM-SIV envelope sealing and opening of stored key material.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! but a fresh random nonce is still drawn for every seal.
//!
//! **Do NOT substitute plain AES-256-GCM with a fixed nonce.** GCM nonce reuse
//! is catastrophic: it breaks both confidentiality and authentication.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aes_gcm_siv::{
    aead::{generic_array::GenericArray, rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::KeyError;
use thiserror::Error;
use zeroize::Zeroizing;

use super::master::MasterKey;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag.
pub const TAG_LEN: usize = 16;

/// Separator between the three envelope fields.
const FIELD_SEPARATOR: char = ':';

/// A parsed envelope.
///
/// The string representation is `<base64(iv)>:<base64(tag)>:<base64(ciphertext)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            STANDARD.encode(self.iv),
            STANDARD.encode(self.tag),
            STANDARD.encode(&self.ciphertext),
            sep = FIELD_SEPARATOR,
        )
    }
}

impl FromStr for Envelope {
    type Err = CipherError;

    /// Parse exactly three colon-separated base64 fields.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(FIELD_SEPARATOR).collect();
        let [iv, tag, ciphertext] = parts.as_slice() else {
            return Err(CipherError::Malformed);
        };

        Ok(Self {
            iv: decode_fixed(iv)?,
            tag: decode_fixed(tag)?,
            ciphertext: STANDARD
                .decode(ciphertext)
                .map_err(|_| CipherError::Malformed)?,
        })
    }
}

fn decode_fixed<const N: usize>(field: &str) -> Result<[u8; N], CipherError> {
    let bytes = STANDARD.decode(field).map_err(|_| CipherError::Malformed)?;
    bytes.try_into().map_err(|_| CipherError::Malformed)
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The envelope string does not match the three-field format.
    #[error("malformed envelope")]
    Malformed,

    /// No configured master key authenticates the envelope.
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// AES-GCM-SIV encryption failed.
    #[error("aead operation failed")]
    AeadFailure,
}

impl From<CipherError> for KeyError {
    fn from(e: CipherError) -> Self {
        KeyError::Integrity(e.to_string())
    }
}

/// Seal `plaintext` under `master`.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] on an internal AEAD error (should be
/// unreachable with a valid key and nonce).
pub fn seal(plaintext: &[u8], master: &MasterKey) -> Result<Envelope, CipherError> {
    let cipher = build_cipher(master)?;

    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| CipherError::AeadFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);

    Ok(Envelope {
        iv,
        tag: tag_bytes,
        ciphertext: buffer,
    })
}

/// Open `envelope` with `master`.
///
/// # Errors
///
/// Returns [`CipherError::AuthenticationFailed`] if the tag does not verify.
/// The returned buffer is only produced on success.
pub fn open(envelope: &Envelope, master: &MasterKey) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let cipher = build_cipher(master)?;
    let mut buffer = Zeroizing::new(envelope.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(&envelope.tag),
        )
        .map_err(|_| CipherError::AuthenticationFailed)?;
    Ok(buffer)
}

fn build_cipher(master: &MasterKey) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(master.bytes()).map_err(|_| CipherError::AeadFailure)
}

/// Seals with the current master key; opens with the current key or any
/// previous master key still configured for reading.
#[derive(Clone, Debug)]
pub struct EnvelopeCipher {
    current: Arc<MasterKey>,
    previous: Vec<Arc<MasterKey>>,
}

impl EnvelopeCipher {
    pub fn new(current: MasterKey) -> Self {
        Self {
            current: Arc::new(current),
            previous: Vec::new(),
        }
    }

    /// Accept envelopes sealed under a retired master key.
    pub fn with_previous(mut self, key: MasterKey) -> Self {
        self.previous.push(Arc::new(key));
        self
    }

    /// Identifier of the master key used for new envelopes.
    pub fn current_key_id(&self) -> &str {
        self.current.id()
    }

    /// Seal `plaintext` and serialise the envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        seal(plaintext, &self.current).map(|env| env.to_string())
    }

    /// Parse and open a serialised envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Malformed`] for an unparseable string and
    /// [`CipherError::AuthenticationFailed`] if no master key verifies it.
    pub fn open(&self, envelope: &str) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let envelope: Envelope = envelope.parse()?;
        std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find_map(|key| open(&envelope, key).ok())
            .ok_or(CipherError::AuthenticationFailed)
    }
}
