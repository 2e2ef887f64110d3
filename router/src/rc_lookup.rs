//! # RC Lookup & Consensus
//!
//! Two jobs share this module because they share one piece of state: the
//! service-node whitelist and greylist.
//!
//! ## Consensus gate
//!
//! In whitelist mode (a service node with `consensus.whitelist_routers`), a
//! peer may hold a session only while it is in the whitelist or greylist,
//! and may be used as a path hop only while it is in the whitelist. Our own
//! standing is derived from the same lists:
//!
//! | Our key in          | State           | Paths | Gossip | Tests peers |
//! |---------------------|-----------------|-------|--------|-------------|
//! | whitelist           | active          | yes   | yes    | yes         |
//! | greylist only       | decommissioned  | no    | no     | yes         |
//! | neither             | deregistered    | no    | no     | no          |
//!
//! Until the first list arrives none of these apply; we are merely waiting.
//!
//! ## Lookups
//!
//! [`RcLookupHandler::get_rc`] answers from the contact store when it can
//! and otherwise asks the DHT. Concurrent requests for one router share a
//! single DHT lookup. Replies are polled by [`RcLookupHandler::pump`] on the
//! orchestration thread, so lookups never touch router state from elsewhere.

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, trace};

use crate::config::{ms, RC_REFRESH_BATCH, RC_REFRESH_INTERVAL, RC_REGEN_INTERVAL};
use crate::contact::RouterContact;
use crate::crypto::RouterId;
use crate::dht::{DhtContext, LookupReply};
use crate::link::LinkLayer;
use crate::nodedb::ContactStore;
use crate::time::Millis;

/// How long before a whitelisted router we still lack is looked up again.
const WHITELIST_REREQUEST_INTERVAL: Millis = 10 * 60 * 1000;

/// Whitelisted routers looked up per exploration round.
const WHITELIST_LOOKUPS_PER_EXPLORE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Success(RouterContact),
    NotFound,
    /// The router is not allowed, or what we found for it failed checks.
    Invalid,
}

#[derive(Debug)]
struct PendingLookup {
    reply: LookupReply,
    waiters: Vec<oneshot::Sender<LookupResult>>,
}

#[derive(Debug)]
pub struct RcLookupHandler {
    us: RouterId,
    netid: String,
    is_service_node: bool,
    whitelist_mode: bool,
    whitelist: HashSet<RouterId>,
    greylist: HashSet<RouterId>,
    whitelist_received: bool,
    strict_connect: BTreeSet<RouterId>,
    bootstrap: BTreeSet<RouterId>,
    pending: HashMap<RouterId, PendingLookup>,
    explores: Vec<LookupReply>,
    lookup_times: HashMap<RouterId, Millis>,
    next_refresh_at: Millis,
}

impl RcLookupHandler {
    pub fn new(
        us: RouterId,
        netid: impl Into<String>,
        is_service_node: bool,
        whitelist_mode: bool,
    ) -> Self {
        Self {
            us,
            netid: netid.into(),
            is_service_node,
            whitelist_mode,
            whitelist: HashSet::new(),
            greylist: HashSet::new(),
            whitelist_received: false,
            strict_connect: BTreeSet::new(),
            bootstrap: BTreeSet::new(),
            pending: HashMap::new(),
            explores: Vec::new(),
            lookup_times: HashMap::new(),
            next_refresh_at: 0,
        }
    }

    pub fn set_strict_connect(&mut self, routers: BTreeSet<RouterId>) {
        self.strict_connect = routers;
    }

    pub fn set_bootstrap(&mut self, routers: impl IntoIterator<Item = RouterId>) {
        self.bootstrap = routers.into_iter().collect();
    }

    /// Our own id changed (client key regeneration).
    pub fn set_us(&mut self, us: RouterId) {
        self.us = us;
    }

    // -----------------------------------------------------------------------
    // Consensus
    // -----------------------------------------------------------------------

    /// Replaces both lists at once.
    pub fn set_whitelist(
        &mut self,
        whitelist: impl IntoIterator<Item = RouterId>,
        greylist: impl IntoIterator<Item = RouterId>,
    ) {
        self.whitelist = whitelist.into_iter().collect();
        self.greylist = greylist.into_iter().collect();
        self.whitelist_received = true;
        info!(
            whitelist = self.whitelist.len(),
            greylist = self.greylist.len(),
            "consensus lists updated"
        );
    }

    pub fn whitelist_mode(&self) -> bool {
        self.whitelist_mode
    }

    pub fn have_received_whitelist(&self) -> bool {
        self.whitelist_received
    }

    pub fn whitelist(&self) -> impl Iterator<Item = &RouterId> {
        self.whitelist.iter()
    }

    pub fn is_greylisted(&self, id: &RouterId) -> bool {
        self.greylist.contains(id)
    }

    /// Consensus-only gate for holding a session with `id`.
    pub fn session_is_allowed(&self, id: &RouterId) -> bool {
        !self.whitelist_mode || self.whitelist.contains(id) || self.greylist.contains(id)
    }

    /// [`session_is_allowed`](Self::session_is_allowed) plus the client
    /// strict-connect restriction (bootstrap routers are always reachable).
    pub fn remote_is_allowed(&self, id: &RouterId) -> bool {
        if !self.strict_connect.is_empty()
            && !self.strict_connect.contains(id)
            && !self.bootstrap.contains(id)
        {
            return false;
        }
        self.session_is_allowed(id)
    }

    /// Whether `id` may be a hop on a path we build.
    pub fn path_is_allowed(&self, id: &RouterId) -> bool {
        if self.is_decommissioned() || self.is_deregistered() {
            return false;
        }
        if !self.strict_connect.is_empty()
            && !self.strict_connect.contains(id)
            && !self.bootstrap.contains(id)
        {
            return false;
        }
        !self.whitelist_mode || self.whitelist.contains(id)
    }

    fn consensus_applies(&self) -> bool {
        self.is_service_node && self.whitelist_mode && self.whitelist_received
    }

    /// In the greylist but not the whitelist.
    pub fn is_decommissioned(&self) -> bool {
        self.consensus_applies()
            && self.greylist.contains(&self.us)
            && !self.whitelist.contains(&self.us)
    }

    /// In neither list.
    pub fn is_deregistered(&self) -> bool {
        self.consensus_applies() && !self.session_is_allowed(&self.us)
    }

    pub fn get_random_whitelist_router(&self) -> Option<RouterId> {
        let candidates: Vec<RouterId> = self
            .whitelist
            .iter()
            .filter(|id| **id != self.us)
            .copied()
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    pub fn number_of_strict_connect(&self) -> usize {
        self.strict_connect.len()
    }

    pub fn is_bootstrap(&self, id: &RouterId) -> bool {
        self.bootstrap.contains(id)
    }

    pub fn bootstrap_count(&self) -> usize {
        self.bootstrap.len()
    }

    // -----------------------------------------------------------------------
    // RC validation
    // -----------------------------------------------------------------------

    /// Accepts `rc` if the remote is allowed and it verifies; public router
    /// contacts are then stored if newer. A rejected contact is also dropped
    /// from the DHT.
    pub fn check_rc(
        &self,
        rc: &RouterContact,
        store: &dyn ContactStore,
        dht: &mut dyn DhtContext,
        now: Millis,
    ) -> bool {
        if !self.remote_is_allowed(&rc.pubkey) {
            trace!(peer = %rc.pubkey.short(), "rc from disallowed router");
            dht.del_node(&rc.pubkey);
            return false;
        }
        if let Err(err) = rc.verify(now, &self.netid) {
            debug!(peer = %rc.pubkey.short(), %err, "rc failed verification");
            dht.del_node(&rc.pubkey);
            return false;
        }
        if rc.is_public_router() {
            store.put(rc.clone());
        }
        true
    }

    /// A peer renegotiated its session with `new_rc`.
    pub fn check_renegotiate_valid(
        &self,
        new_rc: &RouterContact,
        old_rc: &RouterContact,
        store: &dyn ContactStore,
        dht: &mut dyn DhtContext,
        now: Millis,
    ) -> bool {
        if new_rc.pubkey != old_rc.pubkey {
            return false;
        }
        if new_rc.last_updated < old_rc.last_updated {
            debug!(peer = %new_rc.pubkey.short(), "renegotiation with older rc");
            return false;
        }
        if !self.check_rc(new_rc, store, dht, now) {
            return false;
        }
        if dht.has_node(&new_rc.pubkey) {
            dht.put_node(new_rc.clone());
        }
        true
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Resolves the RC of `target`.
    pub fn get_rc(
        &mut self,
        target: RouterId,
        store: &dyn ContactStore,
        dht: &mut dyn DhtContext,
        now: Millis,
    ) -> oneshot::Receiver<LookupResult> {
        let (tx, rx) = oneshot::channel();
        if !self.remote_is_allowed(&target) {
            let _ = tx.send(LookupResult::Invalid);
            return rx;
        }
        if let Some(rc) = store.get(&target) {
            if rc.verify(now, &self.netid).is_ok() {
                let _ = tx.send(LookupResult::Success(rc));
                return rx;
            }
        }
        self.start_lookup(target, dht, now);
        if let Some(pending) = self.pending.get_mut(&target) {
            pending.waiters.push(tx);
        }
        rx
    }

    pub fn has_pending_lookup(&self, target: &RouterId) -> bool {
        self.pending.contains_key(target)
    }

    pub fn num_pending_lookups(&self) -> usize {
        self.pending.len()
    }

    fn start_lookup(&mut self, target: RouterId, dht: &mut dyn DhtContext, now: Millis) {
        if self.pending.contains_key(&target) {
            return;
        }
        trace!(peer = %target.short(), "starting rc lookup");
        self.lookup_times.insert(target, now);
        self.pending.insert(
            target,
            PendingLookup {
                reply: dht.lookup_router(target),
                waiters: Vec::new(),
            },
        );
    }

    /// Delivers finished DHT lookups and explorations.
    pub fn pump(&mut self, store: &dyn ContactStore, dht: &mut dyn DhtContext, now: Millis) {
        let mut finished = Vec::new();
        for (target, pending) in self.pending.iter_mut() {
            match pending.reply.try_recv() {
                Ok(found) => finished.push((*target, Some(found))),
                Err(TryRecvError::Closed) => finished.push((*target, None)),
                Err(TryRecvError::Empty) => {}
            }
        }
        for (target, found) in finished {
            let Some(pending) = self.pending.remove(&target) else {
                continue;
            };
            let result = match found {
                None => LookupResult::NotFound,
                Some(found) => match found.into_iter().find(|rc| rc.pubkey == target) {
                    None => LookupResult::NotFound,
                    Some(rc) if self.check_rc(&rc, store, dht, now) => LookupResult::Success(rc),
                    Some(_) => LookupResult::Invalid,
                },
            };
            for waiter in pending.waiters {
                let _ = waiter.send(result.clone());
            }
        }

        let mut explores = std::mem::take(&mut self.explores);
        explores.retain_mut(|reply| match reply.try_recv() {
            Ok(found) => {
                let mut accepted = 0;
                for rc in found.iter().filter(|rc| rc.pubkey != self.us) {
                    if self.check_rc(rc, store, dht, now) {
                        accepted += 1;
                    }
                }
                trace!(found = found.len(), accepted, "exploration finished");
                false
            }
            Err(TryRecvError::Closed) => false,
            Err(TryRecvError::Empty) => true,
        });
        self.explores = explores;
    }

    /// Looks for routers we do not know yet.
    ///
    /// With few contacts we ask every bootstrap router. In whitelist mode we
    /// then fetch a handful of whitelisted routers we are missing; otherwise
    /// clients ask each connected public router that is not a bootstrap.
    pub fn explore_network(
        &mut self,
        store: &dyn ContactStore,
        dht: &mut dyn DhtContext,
        link: &dyn LinkLayer,
        now: Millis,
    ) {
        let known = store.count_loaded();
        if known <= self.bootstrap.len() {
            for via in &self.bootstrap {
                debug!(via = %via.short(), "exploring via bootstrap router");
                self.explores.push(dht.explore_via(*via));
            }
        }

        if self.whitelist_mode {
            let mut wanted: Vec<RouterId> = self
                .whitelist
                .iter()
                .filter(|id| **id != self.us && !store.has(id))
                .filter(|id| {
                    self.lookup_times
                        .get(*id)
                        .map_or(true, |at| now >= at + WHITELIST_REREQUEST_INTERVAL)
                })
                .copied()
                .collect();
            wanted.shuffle(&mut rand::thread_rng());
            wanted.truncate(WHITELIST_LOOKUPS_PER_EXPLORE);
            for target in wanted {
                self.start_lookup(target, dht, now);
            }
            return;
        }

        if self.is_service_node {
            return;
        }

        let mut vias = Vec::new();
        link.for_each_peer(&mut |s| {
            if s.is_established() && s.is_relay() && !self.bootstrap.contains(&s.peer()) {
                vias.push(s.peer());
            }
        });
        for via in vias {
            debug!(via = %via.short(), "exploring via public router");
            self.explores.push(dht.explore_via(via));
        }
    }

    /// Re-looks-up contacts old enough that their owner should have re-signed
    /// them by now.
    pub fn periodic_update(
        &mut self,
        store: &dyn ContactStore,
        dht: &mut dyn DhtContext,
        now: Millis,
    ) {
        // Past the re-request interval an entry no longer holds anything back.
        self.lookup_times
            .retain(|_, at| now < *at + WHITELIST_REREQUEST_INTERVAL);

        if now < self.next_refresh_at {
            return;
        }
        self.next_refresh_at = now + ms(RC_REFRESH_INTERVAL);
        let stale: Vec<RouterId> = store
            .contacts()
            .into_iter()
            .filter(|rc| rc.age(now) >= ms(RC_REGEN_INTERVAL))
            .map(|rc| rc.pubkey)
            .filter(|id| *id != self.us && !self.pending.contains_key(id))
            .take(RC_REFRESH_BATCH)
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "refreshing stale contacts");
        }
        for target in stale {
            self.start_lookup(target, dht, now);
        }
    }

    pub fn extract_status(&self) -> Value {
        json!({
            "whitelistMode": self.whitelist_mode,
            "whitelistReceived": self.whitelist_received,
            "whitelist": self.whitelist.len(),
            "greylist": self.greylist.len(),
            "pendingLookups": self.pending.len(),
            "pendingExplores": self.explores.len(),
        })
    }
}
