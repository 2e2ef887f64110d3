//! # RC Gossip
//!
//! Service nodes push router contacts to their connected relay peers. Our own
//! RC goes out when it changes; RCs gossiped to us are passed on once.
//!
//! ## Replay suppression
//!
//! Every gossiped RC is recorded by router id in a [`DecayingHashSet`] with a
//! [`GOSSIP_REPLAY_WINDOW`] lifetime. While an id is in the set, further
//! gossip for that router is dropped, so each RC crosses each link at most
//! once per window. Changing our own RC calls [`RcGossiper::forget`] on
//! ourselves so the new version is not held back.
//!
//! ## Fanout
//!
//! Each broadcast goes to at most `max_peers` established relay sessions,
//! sampled at random. The router whose RC is being gossiped never receives
//! its own contact back.

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::config::{ms, GOSSIP_REPLAY_WINDOW};
use crate::contact::RouterContact;
use crate::crypto::RouterId;
use crate::link::{LinkLayer, LinkMessage};
use crate::time::Millis;
use crate::util::DecayingHashSet;

#[derive(Debug)]
pub struct RcGossiper {
    us: RouterId,
    replay: DecayingHashSet<RouterId>,
    enabled: bool,
    max_peers: usize,
    last_gossip_at: Option<Millis>,
}

impl RcGossiper {
    /// `enabled` is false on clients and on test networks that turn gossip
    /// off; a disabled gossiper drops everything.
    pub fn new(us: RouterId, enabled: bool, max_peers: usize) -> Self {
        Self {
            us,
            replay: DecayingHashSet::new(ms(GOSSIP_REPLAY_WINDOW)),
            enabled,
            max_peers,
            last_gossip_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Broadcasts `rc` unless it was gossiped within the replay window.
    /// Returns whether anything was sent.
    pub fn gossip_rc(&mut self, rc: &RouterContact, link: &mut dyn LinkLayer, now: Millis) -> bool {
        if !self.enabled || !rc.is_public_router() {
            return false;
        }
        if !self.replay.insert(rc.pubkey, now) {
            trace!(router = %rc.pubkey.short(), "gossip suppressed by replay window");
            return false;
        }

        let mut peers = Vec::new();
        link.for_each_peer(&mut |s| {
            if s.is_established() && s.is_relay() && s.peer() != rc.pubkey {
                peers.push(s.peer());
            }
        });
        let targets: Vec<RouterId> = peers
            .choose_multiple(&mut rand::thread_rng(), self.max_peers)
            .copied()
            .collect();

        let mut sent = 0;
        for peer in &targets {
            if link.send_to(peer, LinkMessage::GossipRc(rc.clone())) {
                sent += 1;
            }
        }
        if rc.pubkey == self.us {
            self.last_gossip_at = Some(now);
        }
        debug!(router = %rc.pubkey.short(), sent, candidates = peers.len(), "gossiped rc");
        true
    }

    /// Drops replay entries older than the window.
    pub fn decay(&mut self, now: Millis) {
        let expired = self.replay.decay(now);
        if expired > 0 {
            trace!(expired, "gossip replay entries expired");
        }
    }

    /// Lets the next RC for `id` through immediately.
    pub fn forget(&mut self, id: &RouterId) {
        self.replay.forget(id);
    }

    pub fn set_us(&mut self, us: RouterId) {
        self.us = us;
    }

    pub fn last_gossip_at(&self) -> Option<Millis> {
        self.last_gossip_at
    }

    /// When our own RC may next go out, as far as the replay window is
    /// concerned.
    pub fn next_gossip_at(&self) -> Option<Millis> {
        self.replay
            .inserted_at(&self.us)
            .map(|at| at + self.replay.window())
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }
}
