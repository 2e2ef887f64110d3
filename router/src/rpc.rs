//! # Service-Node RPC
//!
//! In whitelist mode a relay's identity key belongs to the service-node
//! registration, so it is fetched from the local directory daemon instead of
//! a key file. The same client is told the outcome of every reachability
//! test.
//!
//! Fetching the key is a bounded retry: [`obtain_identity_with_retry`] makes
//! at most `max_tries` attempts and reports either the key or the last error.

use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::{IdentityKey, RouterId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("bad rpc response: {0}")]
    BadResponse(String),
}

pub trait ServiceNodeRpc: Send + Sync {
    /// The service-node identity key registered with the directory.
    fn obtain_identity_key(&self) -> Result<IdentityKey, RpcError>;

    /// Reports a reachability test outcome for `peer`.
    fn inform_connection(&self, peer: &RouterId, success: bool);

    fn block_height(&self) -> u64;
}

/// Outcome of a bounded identity fetch.
#[derive(Debug)]
pub enum IdentityFetch {
    Success(IdentityKey),
    Exhausted { attempts: u32, last_error: RpcError },
}

pub fn obtain_identity_with_retry(rpc: &dyn ServiceNodeRpc, max_tries: u32) -> IdentityFetch {
    let mut last_error = RpcError::Unavailable("no attempt made".to_string());
    for attempt in 1..=max_tries {
        match rpc.obtain_identity_key() {
            Ok(key) => {
                info!(attempt, router_id = %key.router_id(), "obtained identity key over rpc");
                return IdentityFetch::Success(key);
            }
            Err(err) => {
                warn!(attempt, max_tries, %err, "failed to obtain identity key");
                last_error = err;
            }
        }
    }
    IdentityFetch::Exhausted {
        attempts: max_tries,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRpc;

    #[test]
    fn succeeds_after_transient_failures() {
        let key = IdentityKey::generate();
        let rpc = MockRpc::failing_then(2, key.clone());
        match obtain_identity_with_retry(&rpc, 5) {
            IdentityFetch::Success(got) => assert_eq!(got.router_id(), key.router_id()),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(rpc.identity_calls(), 3);
    }

    #[test]
    fn gives_up_after_max_tries() {
        let rpc = MockRpc::failing_then(10, IdentityKey::generate());
        match obtain_identity_with_retry(&rpc, 5) {
            IdentityFetch::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 5);
                assert!(matches!(last_error, RpcError::Unavailable(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(rpc.identity_calls(), 5);
    }
}
