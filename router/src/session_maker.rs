//! # Outbound Session Maker
//!
//! Opens outbound sessions on the router's behalf and makes sure there is at
//! most one attempt per peer in flight. Every request gets a
//! [`oneshot::Receiver`] that resolves to a [`SessionResult`]; a second
//! request for a peer that is already being dialed just adds another waiter.
//! Dropping a receiver is always fine.
//!
//! A request for a bare [`RouterId`] first resolves the RC through the
//! [`RcLookupHandler`]. The lookup is polled in [`OutboundSessionMaker::pump`],
//! and the handshake outcome arrives as a link event that the router forwards
//! to [`on_session_established`](OutboundSessionMaker::on_session_established)
//! or [`on_connect_timeout`](OutboundSessionMaker::on_connect_timeout).

use std::collections::HashMap;

use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, trace, warn};

use crate::contact::RouterContact;
use crate::crypto::RouterId;
use crate::dht::DhtContext;
use crate::link::LinkLayer;
use crate::nodedb::ContactStore;
use crate::peer_stats::PeerDb;
use crate::profiling::RouterProfiling;
use crate::rc_lookup::{LookupResult, RcLookupHandler};
use crate::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Establish,
    Timeout,
    /// Not allowed by policy, or the RC failed verification.
    InvalidRouter,
    RouterNotFound,
    /// The link layer refused the attempt or the session closed before the
    /// handshake completed.
    EstablishFail,
}

/// Who to connect to.
#[derive(Debug, Clone)]
pub enum SessionTarget {
    Contact(RouterContact),
    Router(RouterId),
}

impl SessionTarget {
    pub fn id(&self) -> RouterId {
        match self {
            Self::Contact(rc) => rc.pubkey,
            Self::Router(id) => *id,
        }
    }
}

/// The collaborators a session attempt touches, borrowed from the router
/// for the duration of one call.
pub struct SessionDeps<'a> {
    pub link: &'a mut dyn LinkLayer,
    pub store: &'a dyn ContactStore,
    pub lookup: &'a mut RcLookupHandler,
    pub dht: &'a mut dyn DhtContext,
    pub profiling: &'a RouterProfiling,
    pub peer_stats: Option<&'a PeerDb>,
}

#[derive(Debug)]
struct PendingSession {
    waiters: Vec<oneshot::Sender<SessionResult>>,
    lookup: Option<oneshot::Receiver<LookupResult>>,
    started_at: Millis,
}

#[derive(Debug)]
pub struct OutboundSessionMaker {
    us: RouterId,
    min_connected: usize,
    max_connected: usize,
    pending: HashMap<RouterId, PendingSession>,
}

impl OutboundSessionMaker {
    pub fn new(us: RouterId, min_connected: usize, max_connected: usize) -> Self {
        Self {
            us,
            min_connected,
            max_connected: max_connected.max(min_connected),
            pending: HashMap::new(),
        }
    }

    pub fn set_us(&mut self, us: RouterId) {
        self.us = us;
    }

    pub fn min_connected(&self) -> usize {
        self.min_connected
    }

    pub fn max_connected(&self) -> usize {
        self.max_connected
    }

    pub fn is_pending(&self, id: &RouterId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Requests a session to `target`. Duplicate requests for a peer already
    /// being dialed are coalesced into the running attempt.
    pub fn create_session_to(
        &mut self,
        target: SessionTarget,
        deps: &mut SessionDeps<'_>,
        now: Millis,
    ) -> oneshot::Receiver<SessionResult> {
        let (tx, rx) = oneshot::channel();
        let id = target.id();

        if let Some(pending) = self.pending.get_mut(&id) {
            trace!(peer = %id.short(), "coalescing session request");
            pending.waiters.push(tx);
            return rx;
        }
        if id == self.us || !deps.lookup.remote_is_allowed(&id) {
            let _ = tx.send(SessionResult::InvalidRouter);
            return rx;
        }
        if deps.link.has_session_to(&id) {
            let _ = tx.send(SessionResult::Establish);
            return rx;
        }

        self.pending.insert(
            id,
            PendingSession {
                waiters: vec![tx],
                lookup: None,
                started_at: now,
            },
        );
        match target {
            SessionTarget::Contact(rc) => self.establish(rc, deps, now),
            SessionTarget::Router(id) => {
                let lookup = deps.lookup.get_rc(id, deps.store, &mut *deps.dht, now);
                if let Some(pending) = self.pending.get_mut(&id) {
                    pending.lookup = Some(lookup);
                }
                // The lookup may already be answered from the store.
                self.poll_lookup(&id, deps, now);
            }
        }
        rx
    }

    fn establish(&mut self, rc: RouterContact, deps: &mut SessionDeps<'_>, now: Millis) {
        let id = rc.pubkey;
        if !rc.is_public_router() || !deps.lookup.check_rc(&rc, deps.store, &mut *deps.dht, now) {
            self.finalize(&id, SessionResult::InvalidRouter, deps, now);
            return;
        }
        if let Some(stats) = deps.peer_stats {
            stats.modify_peer_stats(&id, |s| s.connection_attempts += 1);
        }
        if !deps.link.try_establish_to(&rc) {
            debug!(peer = %id.short(), "link layer refused session attempt");
            self.finalize(&id, SessionResult::EstablishFail, deps, now);
        }
    }

    fn poll_lookup(&mut self, id: &RouterId, deps: &mut SessionDeps<'_>, now: Millis) {
        let Some(pending) = self.pending.get_mut(id) else {
            return;
        };
        let Some(lookup) = pending.lookup.as_mut() else {
            return;
        };
        let outcome = match lookup.try_recv() {
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => LookupResult::NotFound,
            Ok(result) => result,
        };
        pending.lookup = None;
        match outcome {
            LookupResult::Success(rc) => self.establish(rc, deps, now),
            LookupResult::NotFound => self.finalize(id, SessionResult::RouterNotFound, deps, now),
            LookupResult::Invalid => self.finalize(id, SessionResult::InvalidRouter, deps, now),
        }
    }

    /// Advances attempts that are waiting on an RC lookup.
    pub fn pump(&mut self, deps: &mut SessionDeps<'_>, now: Millis) {
        let waiting: Vec<RouterId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.lookup.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            self.poll_lookup(&id, deps, now);
        }
    }

    /// Dials up to `count` random known relays we have no session with.
    /// Returns how many attempts were started.
    pub fn connect_to_random(
        &mut self,
        count: usize,
        deps: &mut SessionDeps<'_>,
        now: Millis,
    ) -> usize {
        let in_use = deps.link.num_connected_routers() + self.pending.len();
        let budget = count.min(self.max_connected.saturating_sub(in_use));
        if budget == 0 {
            return 0;
        }

        let candidates: Vec<RouterContact> = deps
            .store
            .contacts()
            .into_iter()
            .filter(|rc| {
                rc.pubkey != self.us
                    && rc.is_public_router()
                    && !self.pending.contains_key(&rc.pubkey)
                    && deps.lookup.remote_is_allowed(&rc.pubkey)
                    && !deps.link.has_session_to(&rc.pubkey)
                    && !deps.link.has_pending_session_to(&rc.pubkey)
                    && !deps.profiling.is_bad_for_connect(&rc.pubkey)
            })
            .collect();

        let chosen: Vec<RouterContact> = candidates
            .choose_multiple(&mut rand::thread_rng(), budget)
            .cloned()
            .collect();
        let mut started = 0;
        for rc in chosen {
            let id = rc.pubkey;
            drop(self.create_session_to(SessionTarget::Contact(rc), deps, now));
            if self.pending.contains_key(&id) {
                started += 1;
            }
        }
        if started < count {
            trace!(requested = count, started, "fewer random sessions than requested");
        }
        started
    }

    /// A session finished its handshake.
    pub fn on_session_established(
        &mut self,
        peer: &RouterId,
        deps: &mut SessionDeps<'_>,
        now: Millis,
    ) {
        if let Some(stats) = deps.peer_stats {
            stats.modify_peer_stats(peer, |s| {
                s.connection_successes += 1;
                s.last_seen = now;
            });
        }
        self.finalize(peer, SessionResult::Establish, deps, now);
    }

    pub fn on_connect_timeout(&mut self, peer: &RouterId, deps: &mut SessionDeps<'_>, now: Millis) {
        warn!(peer = %peer.short(), "session establish attempt timed out");
        if let Some(stats) = deps.peer_stats {
            stats.modify_peer_stats(peer, |s| s.connection_timeouts += 1);
        }
        self.finalize(peer, SessionResult::Timeout, deps, now);
    }

    /// A session closed; an attempt still waiting on it failed.
    pub fn on_session_closed(&mut self, peer: &RouterId, deps: &mut SessionDeps<'_>, now: Millis) {
        if self.pending.contains_key(peer) {
            if let Some(stats) = deps.peer_stats {
                stats.modify_peer_stats(peer, |s| s.connection_failures += 1);
            }
            self.finalize(peer, SessionResult::EstablishFail, deps, now);
        }
    }

    fn finalize(
        &mut self,
        peer: &RouterId,
        result: SessionResult,
        deps: &mut SessionDeps<'_>,
        now: Millis,
    ) {
        match result {
            SessionResult::Establish => deps.profiling.mark_connect_success(peer, now),
            SessionResult::Timeout | SessionResult::EstablishFail => {
                deps.profiling.mark_connect_timeout(peer, now)
            }
            SessionResult::InvalidRouter | SessionResult::RouterNotFound => {}
        }
        let Some(pending) = self.pending.remove(peer) else {
            return;
        };
        trace!(
            peer = %peer.short(),
            ?result,
            waited_ms = now.saturating_sub(pending.started_at),
            "session attempt finished"
        );
        for waiter in pending.waiters {
            let _ = waiter.send(result);
        }
    }

    pub fn extract_status(&self) -> Value {
        json!({
            "pending": self.pending.len(),
            "minConnected": self.min_connected,
            "maxConnected": self.max_connected,
        })
    }
}
