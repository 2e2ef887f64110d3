//! # Router Contacts
//!
//! ```text
//! router_contact.rs  the signed RC record, validity rules, file IO
//! bootstrap.rs       seed contact sets (single RC or list files)
//! rc_manager.rs      our own RC: sign-and-commit, key rotation
//! ```

pub mod bootstrap;
pub mod rc_manager;
pub mod router_contact;

use std::path::PathBuf;

use thiserror::Error;

pub use bootstrap::BootstrapList;
pub use rc_manager::RcManager;
pub use router_contact::{AddressInfo, RouterContact, RouterVersion};

/// Why an RC could not be signed or failed verification.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing key does not match the contact's public key")]
    KeyMismatch,

    #[error("failed to encode signing payload: {0}")]
    Encode(String),

    #[error("signature does not verify")]
    BadSignature,

    #[error("malformed contact: {0}")]
    Malformed(&'static str),

    #[error("contact is for network {got:?}, expected {expected:?}")]
    WrongNetId { expected: String, got: String },

    #[error("contact has expired")]
    Expired,

    #[error("contact timestamp lies too far in the future")]
    FromFuture,
}

/// Failures reading or writing RC and bootstrap files.
#[derive(Debug, Error)]
pub enum ContactError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode contact: {0}")]
    Encode(#[source] serde_json::Error),
}
