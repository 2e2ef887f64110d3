//! Fatal router errors.
//!
//! Everything here aborts `configure()` or `start()`. Per-tick failures never
//! become a `RouterError`: they are logged where they happen and retried on
//! the next tick.

use std::net::SocketAddr;

use thiserror::Error;

use crate::contact::{ContactError, SignError};
use crate::crypto::KeyError;
use crate::nodedb::StoreError;
use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("key material: {0}")]
    Key(#[from] KeyError),

    #[error("contact file: {0}")]
    Contact(#[from] ContactError),

    #[error("failed to sign our RC: {0}")]
    Sign(#[from] SignError),

    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("could not obtain identity key after {attempts} attempts: {last_error}")]
    IdentityUnavailable { attempts: u32, last_error: RpcError },

    #[error("service-node whitelist mode needs an RPC client")]
    MissingRpc,

    #[error("we have no bootstrap routers")]
    NoBootstrap,

    #[error("strict-connect cannot be used on a service node")]
    StrictConnectOnRelay,

    #[error("exit mode is not supported on a service node")]
    ExitOnRelay,

    #[error("relay has no reachable address; set router.public_addr")]
    NoReachableAddress,

    #[error("failed to bind inbound link on {0}")]
    InboundBind(SocketAddr),

    #[error("failed to bind outbound link on {0}")]
    OutboundBind(SocketAddr),

    #[error("one or more links failed to start")]
    LinkStart,

    #[error("hidden service context failed to start")]
    HiddenServiceStart,

    #[error("failed to add default exit endpoint")]
    ServiceNodeInit,

    #[error("router already started")]
    AlreadyStarted,
}
