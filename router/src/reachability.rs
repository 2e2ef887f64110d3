//! # Reachability Testing
//!
//! Service nodes in whitelist mode periodically dial other whitelisted
//! routers and report the outcome to the service-node daemon, which uses it
//! to decide who gets decommissioned.
//!
//! Each round tests every router currently failing plus one fresh router
//! drawn from a shuffled queue of the whitelist. A failure bumps the
//! router's consecutive-failure count; a success clears it.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::crypto::RouterId;
use crate::rpc::ServiceNodeRpc;
use crate::session_maker::SessionResult;

#[derive(Debug)]
struct PendingTest {
    peer: RouterId,
    previous_fails: u64,
    reply: oneshot::Receiver<SessionResult>,
}

#[derive(Debug, Default)]
pub struct RouterTesting {
    failing: HashMap<RouterId, u64>,
    queue: Vec<RouterId>,
    pending: Vec<PendingTest>,
}

impl RouterTesting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routers currently failing, with their consecutive failure count.
    pub fn get_failing(&self) -> Vec<(RouterId, u64)> {
        self.failing.iter().map(|(id, n)| (*id, *n)).collect()
    }

    pub fn failure_count(&self, id: &RouterId) -> Option<u64> {
        self.failing.get(id).copied()
    }

    /// The next untested router. The queue is refilled from a fresh shuffle
    /// of `whitelist` when it runs dry.
    pub fn next_random<'a>(
        &mut self,
        whitelist: impl Iterator<Item = &'a RouterId>,
        us: &RouterId,
    ) -> Option<RouterId> {
        if self.queue.is_empty() {
            self.queue = whitelist.filter(|id| *id != us).copied().collect();
            self.queue.shuffle(&mut rand::thread_rng());
        }
        self.queue.pop()
    }

    pub fn add_failing_node(&mut self, id: RouterId, previous_fails: u64) {
        self.failing.insert(id, previous_fails + 1);
    }

    pub fn remove_node_from_failing(&mut self, id: &RouterId) {
        self.failing.remove(id);
    }

    pub fn is_testing(&self, id: &RouterId) -> bool {
        self.pending.iter().any(|t| t.peer == *id)
    }

    /// Watches a test session to `peer`.
    pub fn track(
        &mut self,
        peer: RouterId,
        previous_fails: u64,
        reply: oneshot::Receiver<SessionResult>,
    ) {
        self.pending.push(PendingTest {
            peer,
            previous_fails,
            reply,
        });
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Collects finished tests, updates failure counts and reports each
    /// outcome over `rpc`.
    pub fn poll(&mut self, rpc: Option<&dyn ServiceNodeRpc>) -> Vec<(RouterId, SessionResult)> {
        let mut done = Vec::new();
        self.pending.retain_mut(|test| {
            let result = match test.reply.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Closed) => SessionResult::EstablishFail,
                Err(TryRecvError::Empty) => return true,
            };
            done.push((test.peer, test.previous_fails, result));
            false
        });

        let mut results = Vec::with_capacity(done.len());
        for (peer, previous_fails, result) in done {
            let success = result == SessionResult::Establish;
            if success {
                if previous_fails > 0 {
                    info!(peer = %peer.short(), previous_fails, "router passed reachability test");
                } else {
                    debug!(peer = %peer.short(), "router passed reachability test");
                }
                self.remove_node_from_failing(&peer);
            } else {
                warn!(
                    peer = %peer.short(),
                    ?result,
                    fails = previous_fails + 1,
                    "router failed reachability test"
                );
                self.add_failing_node(peer, previous_fails);
            }
            if let Some(rpc) = rpc {
                rpc.inform_connection(&peer, success);
            }
            results.push((peer, result));
        }
        results
    }
}
