//! # Router
//!
//! The orchestrator. A [`Router`] owns every subcomponent of the control core
//! by value and every external collaborator behind a trait object, and drives
//! all of them from [`Router::tick`].
//!
//! ```text
//! configure() -> start() -> tick()* -> stop() -> after_stop_issued() -> close()
//!                                   \-> die()
//! ```
//!
//! Lifecycle state is three flags: `running`, `stopping` and `closed`.
//! `configure` fails on anything an operator has to fix (keys, bootstrap,
//! strict-connect on a relay); `start` fails on anything the host has to fix
//! (binds, reachable address). Past that point nothing returns an error: a
//! failing tick step is logged and retried on the next tick.
//!
//! ## Tick order
//!
//! 1. clock-skew thaw
//! 2. decay (path limiter, profiles, stats report, gossip replay, RC refresh)
//! 3. RC regeneration (relays)
//! 4. gossip of our RC
//! 5. contact store pruning
//! 6. closing sessions to relays that lost consensus
//! 7. persistent sessions
//! 8. client route capture
//! 9. exploration
//! 10. connection deficit
//! 11. path, hidden-service and exit ticks
//! 12. profile and peer-stat persistence
//! 13. DHT reconciliation against established sessions
//! 14. path expiry
//!
//! Completions of lookups, session attempts and reachability tests are
//! collected at the start of each tick.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use crate::config::{
    ms, RouterConfig, DECOMMISSION_WARN_INTERVAL, EXPLORE_INTERVAL_CLIENT,
    EXPLORE_INTERVAL_SERVICE_NODE, IDENTITY_FETCH_MAX_TRIES, MAX_RC_ADDRS, RC_EXPIRES_SOON_WINDOW,
    RC_REGEN_INTERVAL, RC_REGEN_JITTER_MAX, ROUTER_VERSION, STATS_REPORT_INTERVAL,
    TIMESKIP_THRESHOLD,
};
use crate::contact::{AddressInfo, BootstrapList, RcManager, RouterContact};
use crate::crypto::{KeyManager, KeyPaths, RouterId};
use crate::dht::DhtContext;
use crate::disk::DiskQueue;
use crate::endpoint::{ExitContext, HiddenServiceContext, RoutePoker};
use crate::error::RouterError;
use crate::gossip::RcGossiper;
use crate::link::{LinkEvent, LinkLayer};
use crate::metrics::RouterMetrics;
use crate::nodedb::ContactStore;
use crate::path::{PathBuildLimiter, PathContext};
use crate::peer_stats::PeerDb;
use crate::profiling::RouterProfiling;
use crate::rc_lookup::RcLookupHandler;
use crate::reachability::RouterTesting;
use crate::rpc::{obtain_identity_with_retry, IdentityFetch, ServiceNodeRpc};
use crate::session_maker::{OutboundSessionMaker, SessionDeps, SessionResult, SessionTarget};
use crate::time::{human_duration, Millis};


/// Borrows the session maker's collaborators out of a router, field by
/// field, so the session maker itself stays mutably borrowable.
macro_rules! session_deps {
    ($router:expr) => {
        SessionDeps {
            link: &mut *$router.link,
            store: &*$router.store,
            lookup: &mut $router.lookup,
            dht: &mut *$router.dht,
            profiling: &*$router.profiling,
            peer_stats: $router.peer_stats.as_deref(),
        }
    };
}

/// The external subsystems a router drives.
pub struct Collaborators {
    pub link: Box<dyn LinkLayer>,
    pub store: Arc<dyn ContactStore>,
    pub dht: Box<dyn DhtContext>,
    pub paths: Box<dyn PathContext>,
    pub hidden_services: Box<dyn HiddenServiceContext>,
    pub exits: Box<dyn ExitContext>,
    pub route_poker: Box<dyn RoutePoker>,
    pub disk: Arc<dyn DiskQueue>,
    /// Required in whitelist mode.
    pub rpc: Option<Arc<dyn ServiceNodeRpc>>,
    pub peer_stats: Option<Arc<PeerDb>>,
}

pub struct Router {
    config: RouterConfig,
    rc: RcManager,
    bootstrap: BootstrapList,

    link: Box<dyn LinkLayer>,
    store: Arc<dyn ContactStore>,
    dht: Box<dyn DhtContext>,
    paths: Box<dyn PathContext>,
    hidden_services: Box<dyn HiddenServiceContext>,
    exits: Box<dyn ExitContext>,
    route_poker: Box<dyn RoutePoker>,
    disk: Arc<dyn DiskQueue>,
    rpc: Option<Arc<dyn ServiceNodeRpc>>,
    peer_stats: Option<Arc<PeerDb>>,

    lookup: RcLookupHandler,
    session_maker: OutboundSessionMaker,
    gossiper: RcGossiper,
    testing: RouterTesting,
    profiling: Arc<RouterProfiling>,
    path_limiter: PathBuildLimiter,
    metrics: RouterMetrics,

    running: bool,
    stopping: bool,
    closed: bool,
    started_at: Millis,
    last_tick: Millis,
    next_explore_at: Millis,
    next_decommission_warn_at: Millis,
    next_stats_report_at: Millis,
    /// Uptime required before the first gossip.
    gossip_start_delay: Millis,
}

impl Router {
    // -----------------------------------------------------------------------
    // Configure / start
    // -----------------------------------------------------------------------

    /// Loads keys and bootstrap contacts and builds every subcomponent.
    pub fn configure(
        config: RouterConfig,
        collaborators: Collaborators,
        now: Millis,
    ) -> Result<Self, RouterError> {
        let is_relay = config.router.is_relay;
        if is_relay && !config.network.strict_connect.is_empty() {
            return Err(RouterError::StrictConnectOnRelay);
        }

        let key_paths = KeyPaths::from_config(&config);
        let keys = if config.whitelist_mode() {
            let rpc = collaborators.rpc.as_deref().ok_or(RouterError::MissingRpc)?;
            match obtain_identity_with_retry(rpc, IDENTITY_FETCH_MAX_TRIES) {
                IdentityFetch::Success(identity) => KeyManager::with_identity(key_paths, identity)?,
                IdentityFetch::Exhausted {
                    attempts,
                    last_error,
                } => {
                    return Err(RouterError::IdentityUnavailable {
                        attempts,
                        last_error,
                    })
                }
            }
        } else {
            KeyManager::load_or_generate(key_paths)?
        };

        let mut rc = RcManager::new(keys, config.router.netid.clone());
        let rc_path = config.rc_path();
        if rc_path.exists() {
            match RouterContact::read_file(&rc_path) {
                Ok(previous) => rc.restore_timestamp(&previous),
                Err(err) => warn!(%err, "ignoring unreadable rc file"),
            }
        }
        let us = rc.router_id();

        let mut bootstrap = BootstrapList::load(&config.bootstrap, &config.router.data_dir)?;
        let dropped = bootstrap.clear_invalid(now, &config.router.netid, &us);
        if dropped > 0 {
            warn!(dropped, "dropped invalid bootstrap contacts");
        }
        if bootstrap.is_empty() {
            if config.bootstrap.seed_node {
                info!("running as seed node without bootstrap routers");
            } else {
                return Err(RouterError::NoBootstrap);
            }
        }

        let profiling = Arc::new(RouterProfiling::new());
        if config.network.enable_profiling {
            let path = config.profiles_path();
            if path.exists() {
                match profiling.load(&path) {
                    Ok(count) => info!(count, "loaded router profiles"),
                    Err(err) => warn!(%err, "failed to load router profiles"),
                }
            }
        } else {
            info!("router profiling disabled");
            profiling.disable();
        }

        let mut lookup = RcLookupHandler::new(
            us,
            config.router.netid.clone(),
            is_relay,
            config.whitelist_mode(),
        );
        lookup.set_strict_connect(config.network.strict_connect.clone());
        lookup.set_bootstrap(bootstrap.ids().copied());

        let session_maker = OutboundSessionMaker::new(
            us,
            config.router.min_connected_routers,
            config.router.max_connected_routers,
        );
        let gossiper = RcGossiper::new(
            us,
            is_relay && !config.gossip.disable_testing_only,
            config.gossip.max_peers,
        );
        let gossip_start_delay = config.gossip.start_delay_min_ms
            + rand::thread_rng().gen_range(0..=config.gossip.start_delay_spread_ms);

        info!(router_id = %us, relay = is_relay, bootstrap = bootstrap.len(), "router configured");

        Ok(Self {
            rc,
            bootstrap,
            link: collaborators.link,
            store: collaborators.store,
            dht: collaborators.dht,
            paths: collaborators.paths,
            hidden_services: collaborators.hidden_services,
            exits: collaborators.exits,
            route_poker: collaborators.route_poker,
            disk: collaborators.disk,
            rpc: collaborators.rpc,
            peer_stats: collaborators.peer_stats,
            lookup,
            session_maker,
            gossiper,
            testing: RouterTesting::new(),
            profiling,
            path_limiter: PathBuildLimiter::default(),
            metrics: RouterMetrics::new()?,
            running: false,
            stopping: false,
            closed: false,
            started_at: 0,
            last_tick: 0,
            next_explore_at: 0,
            next_decommission_warn_at: 0,
            next_stats_report_at: 0,
            gossip_start_delay,
            config,
        })
    }

    /// Binds links, signs our RC and brings every subsystem up.
    pub fn start(&mut self, now: Millis) -> Result<(), RouterError> {
        if self.running || self.stopping || self.closed {
            return Err(RouterError::AlreadyStarted);
        }
        let is_relay = self.is_service_node();
        if is_relay && self.config.network.exit_enabled {
            return Err(RouterError::ExitOnRelay);
        }

        let mut inbound = self.config.links.inbound.clone();
        if is_relay && inbound.is_empty() {
            let public = self
                .config
                .router
                .public_addr
                .ok_or(RouterError::NoReachableAddress)?;
            inbound.push(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                public.port(),
            ));
        }
        for bind in inbound {
            if !self.link.configure_inbound(bind) {
                return Err(RouterError::InboundBind(bind));
            }
        }
        let outbound = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.links.outbound_port,
        );
        if !self.link.configure_outbound(outbound) {
            return Err(RouterError::OutboundBind(outbound));
        }

        let addrs = if is_relay {
            self.advertised_addresses()?
        } else {
            Vec::new()
        };
        let candidate = self.rc.prepare(&self.config.router.nickname, addrs, is_relay);
        self.rc.sign_and_commit(candidate, now)?;
        if is_relay {
            self.save_rc(now);
        }

        if !self.link.start() {
            return Err(RouterError::LinkStart);
        }

        if is_relay {
            self.paths.allow_transit();
            self.dht.allow_transit();
            if !self.exits.add_default_endpoint() {
                return Err(RouterError::ServiceNodeInit);
            }
            self.profiling.disable();
        } else {
            self.rc.regenerate_ephemeral(now)?;
            let us = self.rc.router_id();
            self.lookup.set_us(us);
            self.session_maker.set_us(us);
            self.gossiper.set_us(us);
            debug!(router_id = %us, "using ephemeral client identity");
        }

        if !self.hidden_services.start_all() {
            return Err(RouterError::HiddenServiceStart);
        }

        match self.store.load_from_disk() {
            Ok(count) => info!(count, "loaded contacts from disk"),
            Err(err) => warn!(%err, "failed to load contacts from disk"),
        }
        self.dht.start(self.rc.router_id());
        for rc in self.bootstrap.iter() {
            self.store.put(rc.clone());
            self.dht.put_node(rc.clone());
        }

        self.started_at = now;
        self.last_tick = now;
        self.next_stats_report_at = now;
        self.running = true;
        info!(
            router_id = %self.rc.router_id(),
            relay = is_relay,
            known = self.store.count_loaded(),
            "router started"
        );
        Ok(())
    }

    /// Addresses for our RC: `public_addr` when set, otherwise every
    /// concrete inbound address.
    fn advertised_addresses(&self) -> Result<Vec<AddressInfo>, RouterError> {
        let transport_key = self.rc.keys().transport().public_key();
        let addrs: Vec<SocketAddr> = match self.config.router.public_addr {
            Some(public) => vec![public],
            None => self
                .link
                .inbound_addresses()
                .into_iter()
                .filter(|a| !a.ip().is_unspecified())
                .take(MAX_RC_ADDRS)
                .collect(),
        };
        if addrs.is_empty() {
            return Err(RouterError::NoReachableAddress);
        }
        Ok(addrs
            .into_iter()
            .enumerate()
            .map(|(rank, addr)| AddressInfo {
                addr,
                transport_key,
                rank: rank as u16,
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub fn tick(&mut self, now: Millis) {
        if !self.running || self.stopping {
            return;
        }
        self.metrics.ticks_total.inc();
        let is_relay = self.is_service_node();
        let us = self.rc.router_id();

        // 1. A frozen process or a clock jump leaves every session stale.
        let skew = now.abs_diff(self.last_tick);
        if skew > ms(TIMESKIP_THRESHOLD) {
            warn!(skew = %human_duration(skew), "clock skew detected, thawing network state");
            self.thaw();
        }

        self.pump_completions(now);

        // 2.
        self.path_limiter.decay(now);
        self.profiling.tick(now);
        if now >= self.next_stats_report_at {
            self.report_stats(now);
            self.next_stats_report_at = now + ms(STATS_REPORT_INTERVAL);
        }
        self.gossiper.decay(now);
        self.lookup.periodic_update(&*self.store, &mut *self.dht, now);

        // 3-4.
        let mut should_gossip = is_relay
            && self.lookup.whitelist_mode()
            && self.lookup.have_received_whitelist()
            && self.lookup.session_is_allowed(&us);
        if is_relay {
            let jitter = rand::thread_rng().gen_range(0..ms(RC_REGEN_JITTER_MAX));
            if self
                .rc
                .is_expiring_within(now, ms(RC_EXPIRES_SOON_WINDOW), jitter)
                || self.rc.age(now) > ms(RC_REGEN_INTERVAL)
            {
                info!("regenerating rc");
                if self.update_our_rc(false, now) {
                    should_gossip = true;
                } else {
                    error!("failed to update our rc");
                }
            }
        }
        let decommissioned = self.lookup.is_decommissioned();
        let deregistered = self.lookup.is_deregistered();
        if should_gossip {
            self.gossip_rc_if_needed(now);
        }

        // 5-6. One read of the consensus lists serves both passes.
        let whitelist_pending =
            self.lookup.whitelist_mode() && !self.lookup.have_received_whitelist();
        self.prune_contacts(now, whitelist_pending);
        if !whitelist_pending {
            self.close_disallowed_sessions();
        }

        // 7.
        self.link.check_persisting_sessions(now);

        // 8.
        if !is_relay {
            if self.hidden_services.has_exit() {
                if !self.route_poker.is_enabled() {
                    self.route_poker.enable();
                }
            } else if self.route_poker.is_enabled() {
                self.route_poker.disable();
            }
            self.route_poker.update();
        }

        // 9.
        let explore_interval = if is_relay {
            EXPLORE_INTERVAL_SERVICE_NODE
        } else {
            EXPLORE_INTERVAL_CLIENT
        };
        if !decommissioned && now >= self.next_explore_at {
            self.next_explore_at = now + ms(explore_interval);
            self.lookup
                .explore_network(&*self.store, &mut *self.dht, &*self.link, now);
        }

        // 10.
        let mut connected = self.link.num_connected_routers();
        if !is_relay {
            connected += self.link.num_pending();
        }
        let mut connect_to = self.session_maker.min_connected();
        let strict = self.lookup.number_of_strict_connect();
        if strict > 0 {
            connect_to = connect_to.min(strict);
        }
        if (decommissioned || deregistered) && now >= self.next_decommission_warn_at {
            self.next_decommission_warn_at = now + ms(DECOMMISSION_WARN_INTERVAL);
            if deregistered {
                warn!("we appear to be deregistered, not connecting to new routers");
            } else {
                warn!("we appear to be decommissioned, not building paths or gossiping");
            }
        }
        if connected < connect_to && !deregistered {
            let wanted = connect_to - connected;
            trace!(connected, wanted, "connecting to random routers");
            let started = self
                .session_maker
                .connect_to_random(wanted, &mut session_deps!(self), now);
            self.metrics.outbound_attempts_total.inc_by(started as u64);
        }

        // 11.
        self.paths.tick(now);
        self.hidden_services.tick(now);
        self.exits.tick(now);

        // 12.
        self.persist_if_due(now);

        // 13.
        let mut established = HashSet::new();
        self.link.for_each_peer(&mut |s| {
            if s.is_established() {
                established.insert(s.peer());
            }
        });
        let stale = self
            .dht
            .remove_nodes_if(&|id: &RouterId| !established.contains(id));
        if stale > 0 {
            trace!(stale, "removed dht nodes without sessions");
        }

        // 14.
        self.paths.expire_paths(now);

        self.link.pump();
        self.hidden_services.pump();
        self.paths.pump_upstream();
        self.paths.pump_downstream();

        self.metrics.known_routers.set(self.store.count_loaded() as i64);
        self.metrics
            .connected_routers
            .set(self.link.num_connected_routers() as i64);
        self.last_tick = now;
    }

    fn pump_completions(&mut self, now: Millis) {
        self.lookup.pump(&*self.store, &mut *self.dht, now);
        self.session_maker.pump(&mut session_deps!(self), now);
        for (_, result) in self.testing.poll(self.rpc.as_deref()) {
            if result != SessionResult::Establish {
                self.metrics.reachability_failures_total.inc();
            }
        }
    }

    /// Closes every session and resets endpoint state.
    fn thaw(&mut self) {
        let mut peers = Vec::new();
        self.link.for_each_peer(&mut |s| peers.push(s.peer()));
        for peer in &peers {
            self.link.close_session_to(peer);
        }
        self.hidden_services.thaw_all();
        self.metrics.thaws_total.inc();
        info!(closed = peers.len(), "network state thawed");
    }

    fn prune_contacts(&mut self, now: Millis, whitelist_pending: bool) {
        let is_relay = self.is_service_node();
        let lookup = &self.lookup;
        let bootstrap = &self.bootstrap;
        let netid = self.config.router.netid.as_str();
        let removed = self.store.remove_if(&|rc: &RouterContact| {
            if bootstrap.contains(&rc.pubkey) {
                return false;
            }
            if rc.verify(now, netid).is_err() || !rc.is_public_router() {
                return true;
            }
            if !is_relay || whitelist_pending {
                return false;
            }
            !lookup.session_is_allowed(&rc.pubkey)
        });
        if removed > 0 {
            debug!(removed, "pruned contacts");
        }
    }

    fn close_disallowed_sessions(&mut self) {
        let mut close = Vec::new();
        let lookup = &self.lookup;
        self.link.for_each_peer(&mut |s| {
            if s.is_relay() && !lookup.session_is_allowed(&s.peer()) {
                close.push(s.peer());
            }
        });
        for peer in close {
            info!(peer = %peer.short(), "closing session to router outside consensus");
            self.link.close_session_to(&peer);
            self.metrics.disallowed_sessions_closed_total.inc();
        }
    }

    fn persist_if_due(&mut self, now: Millis) {
        if self.config.network.save_profiles && self.profiling.should_save(now) {
            self.profiling.mark_save_scheduled(now);
            let profiling = Arc::clone(&self.profiling);
            let path = self.config.profiles_path();
            self.disk.enqueue(Box::new(move || {
                if let Err(err) = profiling.save(&path) {
                    warn!(%err, "failed to save router profiles");
                }
            }));
        }
        if let Some(stats) = &self.peer_stats {
            if stats.should_flush(now) {
                stats.mark_flush_scheduled(now);
                let stats = Arc::clone(stats);
                self.disk.enqueue(Box::new(move || match stats.flush() {
                    Ok(count) => trace!(count, "peer stats flushed"),
                    Err(err) => warn!(%err, "failed to flush peer stats"),
                }));
            }
        }
    }

    /// Whether the consensus view lets us gossip at all. Outside whitelist
    /// mode every relay may.
    fn consensus_allows_gossip(&self) -> bool {
        if !self.lookup.whitelist_mode() {
            return true;
        }
        self.lookup.have_received_whitelist()
            && self.lookup.session_is_allowed(&self.rc.router_id())
            && !self.lookup.is_decommissioned()
            && !self.lookup.is_deregistered()
    }

    fn gossip_rc_if_needed(&mut self, now: Millis) {
        if self.config.gossip.disable_testing_only || !self.is_service_node() {
            return;
        }
        if !self.consensus_allows_gossip() {
            trace!("consensus view does not allow gossip");
            return;
        }
        if self.uptime(now) < self.gossip_start_delay {
            return;
        }
        let rc = self.rc.current().clone();
        if self.gossiper.gossip_rc(&rc, &mut *self.link, now) {
            self.metrics.gossip_broadcasts_total.inc();
        }
    }

    fn save_rc(&self, now: Millis) {
        let rc = self.rc.current().clone();
        if let Err(err) = rc.verify(now, self.rc.netid()) {
            error!(%err, "refusing to save an rc that does not verify");
            return;
        }
        let path = self.config.rc_path();
        self.disk.enqueue(Box::new(move || {
            if let Err(err) = rc.write_file(&path) {
                warn!(%err, "failed to save our rc");
            }
        }));
    }

    // -----------------------------------------------------------------------
    // Our RC
    // -----------------------------------------------------------------------

    /// Re-signs our RC, rotating the onion key first when `rotate` is set.
    /// A rotation renegotiates every established session.
    pub fn update_our_rc(&mut self, rotate: bool, now: Millis) -> bool {
        if rotate {
            if let Err(err) = self.rc.rotate_encryption_key(now) {
                error!(%err, "failed to rotate encryption key");
                return false;
            }
        } else if let Err(err) = self.rc.resign(now) {
            error!(%err, "failed to re-sign our rc");
            return false;
        }

        if rotate {
            let mut peers = Vec::new();
            self.link.for_each_peer(&mut |s| {
                if s.is_established() {
                    peers.push(s.peer());
                }
            });
            for peer in peers {
                if self.link.renegotiate_session(&peer) {
                    debug!(peer = %peer.short(), "renegotiated session");
                } else {
                    warn!(peer = %peer.short(), "failed to renegotiate session");
                }
            }
        }
        self.our_rc_changed(now);
        true
    }

    /// Rotates the onion key and gossips the result.
    pub fn rotate_keys(&mut self, now: Millis) -> bool {
        if !self.update_our_rc(true, now) {
            return false;
        }
        self.gossip_rc_if_needed(now);
        true
    }

    /// Applies `edit` to a copy of our RC. `None` leaves everything as is;
    /// otherwise the edit is signed, committed and gossiped.
    pub fn modify_our_rc(
        &mut self,
        edit: impl FnOnce(RouterContact) -> Option<RouterContact>,
        now: Millis,
    ) -> bool {
        let Some(candidate) = edit(self.rc.candidate()) else {
            return false;
        };
        if let Err(err) = self.rc.sign_and_commit(candidate, now) {
            warn!(%err, "rejected rc modification");
            return false;
        }
        self.our_rc_changed(now);
        self.gossip_rc_if_needed(now);
        true
    }

    fn our_rc_changed(&mut self, now: Millis) {
        self.metrics.rc_regenerations_total.inc();
        self.gossiper.forget(&self.rc.router_id());
        if self.is_service_node() {
            self.save_rc(now);
        }
    }

    // -----------------------------------------------------------------------
    // Link events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: LinkEvent, now: Millis) {
        if self.closed {
            return;
        }
        // Once stopping, only closes are still worth bookkeeping.
        if self.stopping && !matches!(event, LinkEvent::Closed { .. }) {
            trace!("ignoring link event while stopping");
            return;
        }
        match event {
            LinkEvent::Established { peer, inbound, rc } => {
                trace!(peer = %peer.short(), inbound, "session established");
                if let Some(rc) = rc.filter(|rc| rc.pubkey == peer) {
                    if self
                        .lookup
                        .check_rc(&rc, &*self.store, &mut *self.dht, now)
                        && rc.is_public_router()
                    {
                        if !self.is_service_node() {
                            for addr in &rc.addrs {
                                self.route_poker.add_route(addr.addr.ip());
                            }
                        }
                        self.dht.put_node(rc);
                    }
                }
                self.session_maker
                    .on_session_established(&peer, &mut session_deps!(self), now);
            }
            LinkEvent::TimedOut { peer } => {
                self.session_maker
                    .on_connect_timeout(&peer, &mut session_deps!(self), now);
            }
            LinkEvent::Closed { peer } => self.session_closed(peer, now),
            LinkEvent::GossipReceived { from, rc } => self.handle_gossiped_rc(from, rc, now),
        }
    }

    fn session_closed(&mut self, peer: RouterId, now: Millis) {
        debug!(peer = %peer.short(), "session closed");
        self.dht.del_node(&peer);
        if !self.is_service_node() {
            if let Some(rc) = self.store.get(&peer) {
                for addr in &rc.addrs {
                    self.route_poker.del_route(addr.addr.ip());
                }
            }
        }
        self.session_maker
            .on_session_closed(&peer, &mut session_deps!(self), now);
    }

    fn handle_gossiped_rc(&mut self, from: RouterId, rc: RouterContact, now: Millis) {
        if rc.pubkey == self.rc.router_id() {
            return;
        }
        if let Some(stats) = &self.peer_stats {
            stats.handle_gossiped_rc(&rc, now);
        }
        if let Some(known) = self.store.get(&rc.pubkey) {
            if !rc.is_newer_than(&known) {
                trace!(from = %from.short(), router = %rc.pubkey.short(), "gossiped rc is not newer");
                return;
            }
        }
        if !self.lookup.check_rc(&rc, &*self.store, &mut *self.dht, now) {
            debug!(from = %from.short(), router = %rc.pubkey.short(), "rejected gossiped rc");
            return;
        }
        if self.is_service_node()
            && self.consensus_allows_gossip()
            && self.gossiper.gossip_rc(&rc, &mut *self.link, now)
        {
            self.metrics.gossip_broadcasts_total.inc();
        }
    }

    /// A peer presented `new_rc` while renegotiating a session that was
    /// opened with `old_rc`.
    pub fn check_renegotiate_valid(
        &mut self,
        new_rc: &RouterContact,
        old_rc: &RouterContact,
        now: Millis,
    ) -> bool {
        self.lookup
            .check_renegotiate_valid(new_rc, old_rc, &*self.store, &mut *self.dht, now)
    }

    // -----------------------------------------------------------------------
    // Consensus
    // -----------------------------------------------------------------------

    pub fn set_whitelist(
        &mut self,
        whitelist: impl IntoIterator<Item = RouterId>,
        greylist: impl IntoIterator<Item = RouterId>,
    ) {
        self.lookup.set_whitelist(whitelist, greylist);
    }

    pub fn looks_decommissioned(&self) -> bool {
        self.lookup.is_decommissioned()
    }

    pub fn looks_deregistered(&self) -> bool {
        self.lookup.is_deregistered()
    }

    /// Only registered service nodes that already have the lists test
    /// others; decommissioned nodes still do.
    pub fn should_test_other_routers(&self) -> bool {
        if !self.is_service_node() {
            return false;
        }
        if !self.lookup.whitelist_mode() {
            return true;
        }
        if !self.lookup.have_received_whitelist() {
            return false;
        }
        self.lookup.session_is_allowed(&self.rc.router_id())
    }

    pub fn session_to_router_allowed(&self, id: &RouterId) -> bool {
        self.lookup.session_is_allowed(id)
    }

    pub fn path_to_router_allowed(&self, id: &RouterId) -> bool {
        self.lookup.path_is_allowed(id)
    }

    /// Whether a path build through `hop` may start now. Records the
    /// attempt when it may.
    pub fn path_build_allowed(&mut self, hop: RouterId, now: Millis) -> bool {
        self.path_to_router_allowed(&hop)
            && !self.profiling.is_bad_for_path(&hop)
            && self.path_limiter.attempt(hop, now)
    }

    /// One round of reachability tests: every failing router plus one new
    /// random whitelisted router.
    pub fn run_reachability_tests(&mut self, now: Millis) {
        if !self.running || self.stopping || !self.should_test_other_routers() {
            return;
        }
        let us = self.rc.router_id();
        let mut tests = self.testing.get_failing();
        if let Some(next) = self.testing.next_random(self.lookup.whitelist(), &us) {
            if !tests.iter().any(|(id, _)| *id == next) {
                tests.push((next, 0));
            }
        }
        for (router, fails) in tests {
            if self.testing.is_testing(&router) {
                continue;
            }
            if !self.lookup.session_is_allowed(&router) {
                self.testing.remove_node_from_failing(&router);
                continue;
            }
            trace!(peer = %router.short(), fails, "testing router reachability");
            let reply = self.session_maker.create_session_to(
                SessionTarget::Router(router),
                &mut session_deps!(self),
                now,
            );
            self.testing.track(router, fails, reply);
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// First phase of a graceful stop. Returns `false` if a stop is already
    /// under way or the router never ran.
    pub fn stop(&mut self) -> bool {
        if !self.running || self.stopping || self.closed {
            return false;
        }
        info!("stopping router");
        self.stopping = true;
        self.hidden_services.stop_all();
        self.exits.stop();
        self.paths.pump_upstream();
        self.link.pump();
        true
    }

    /// Second phase: links go down and the contact store is saved.
    pub fn after_stop_issued(&mut self) {
        if self.closed {
            return;
        }
        self.link.stop();
        let store = Arc::clone(&self.store);
        self.disk.enqueue(Box::new(move || {
            if let Err(err) = store.save_to_disk() {
                warn!(%err, "failed to save contacts on shutdown");
            }
        }));
    }

    /// Final phase.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.dht.stop();
        self.closed = true;
        self.running = false;
        info!("router closed");
    }

    /// Immediate shutdown, without saving the contact store.
    pub fn die(&mut self) {
        if self.stopping || self.closed {
            return;
        }
        warn!("router dying");
        self.stopping = true;
        self.hidden_services.stop_all();
        self.exits.stop();
        self.link.stop();
        self.close();
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_service_node(&self) -> bool {
        self.config.router.is_relay
    }

    pub fn whitelist_mode(&self) -> bool {
        self.lookup.whitelist_mode()
    }

    pub fn uptime(&self, now: Millis) -> Millis {
        if self.running {
            now.saturating_sub(self.started_at)
        } else {
            0
        }
    }

    pub fn router_id(&self) -> RouterId {
        self.rc.router_id()
    }

    pub fn rc(&self) -> &RouterContact {
        self.rc.current()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    pub fn lookup(&self) -> &RcLookupHandler {
        &self.lookup
    }

    pub fn bootstrap(&self) -> &BootstrapList {
        &self.bootstrap
    }

    pub fn profiling(&self) -> &RouterProfiling {
        &self.profiling
    }

    pub fn testing(&self) -> &RouterTesting {
        &self.testing
    }

    pub fn gossiper(&self) -> &RcGossiper {
        &self.gossiper
    }

    pub fn extract_status(&self) -> Value {
        if !self.running {
            return json!({ "running": false });
        }
        let rc = self.rc.current();
        json!({
            "running": true,
            "numNodesKnown": self.store.count_loaded(),
            "dht": self.dht.extract_status(),
            "services": self.hidden_services.extract_status(),
            "exit": self.exits.extract_status(),
            "links": self.link.extract_status(),
            "outboundMessages": self.session_maker.extract_status(),
            "rcLookup": self.lookup.extract_status(),
            "paths": self.paths.extract_status(),
            "rc": {
                "pubkey": rc.pubkey.to_hex(),
                "lastUpdated": rc.last_updated,
                "hash": hex::encode(rc.content_hash()),
            },
        })
    }

    pub fn extract_summary_status(&self, now: Millis) -> Value {
        if !self.running {
            return json!({ "running": false });
        }
        let (successes, attempts) = self.paths.build_stats();
        let mut tx_rate = 0u64;
        let mut rx_rate = 0u64;
        self.link.for_each_peer(&mut |s| {
            tx_rate += s.tx_rate();
            rx_rate += s.rx_rate();
        });
        let [major, minor, patch] = ROUTER_VERSION;
        json!({
            "running": true,
            "version": format!("murk-{major}.{minor}.{patch}"),
            "uptime": self.uptime(now),
            "numPathsBuilt": self.paths.owned_path_count(),
            "numPeersConnected": self.link.num_connected_routers() + self.link.num_connected_clients(),
            "numRoutersKnown": self.store.count_loaded(),
            "ratio": successes as f64 / (attempts + 1) as f64,
            "txRate": tx_rate,
            "rxRate": rx_rate,
        })
    }

    /// Hourly summary in the log.
    pub fn report_stats(&self, now: Millis) {
        let rc = self.rc.current();
        info!(
            known = self.store.count_loaded(),
            bootstrap = self.bootstrap.len(),
            routers = self.link.num_connected_routers(),
            "router stats"
        );
        if self.is_service_node() {
            info!(
                clients = self.link.num_connected_clients(),
                rc_age = %human_duration(rc.age(now)),
                rc_expires_in = %human_duration(rc.time_until_expires(now)),
                "service node stats"
            );
        }
    }
}
