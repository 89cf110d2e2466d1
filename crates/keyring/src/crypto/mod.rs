//! Envelope encryption of stored key material.
//!
//! This module is intentionally free of store and cache dependencies.
//! It provides master key derivation and the seal/open operations used by
//! the manager.
//!
//! # Envelope format
//!
//! ```text
//! <base64(iv)>:<base64(auth tag)>:<base64(ciphertext)>
//! ```
//!
//! The envelope carries no master key identifier; [`EnvelopeCipher`] tries
//! each configured master key and the AEAD tag selects the right one.

pub mod cipher;
pub mod master;

pub use cipher::{CipherError, Envelope, EnvelopeCipher};
pub use master::{MasterKey, MasterSecretProvider, KEY_LEN};
