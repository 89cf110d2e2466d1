//! Key model and error taxonomy shared across `keyring` crates.

pub mod error;
pub mod model;

pub use error::KeyError;
pub use model::{KeyMetadata, KeyState, KeyType};
