//! # Router Key Material
//!
//! Thin wrappers over `ed25519-dalek` and `x25519-dalek`, plus the key-file
//! manager. Nothing in here implements a primitive.

pub mod key_manager;
pub mod keys;

pub use key_manager::{KeyManager, KeyPaths};
pub use keys::{EncryptionKey, EncryptionPublicKey, IdentityKey, KeyError, RouterId, Signature};
