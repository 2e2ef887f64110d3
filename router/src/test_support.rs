//! In-memory doubles for the router's collaborators.
//!
//! Every double keeps its state behind an `Arc<Mutex<..>>`, so a test can
//! hand one clone to the router and keep another to inspect what the router
//! did with it.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::config::DEFAULT_NETID;
use crate::contact::{AddressInfo, RouterContact, RouterVersion};
use crate::crypto::{EncryptionKey, IdentityKey, RouterId};
use crate::dht::{DhtContext, LookupReply};
use crate::disk::{DiskJob, DiskQueue};
use crate::endpoint::{ExitContext, HiddenServiceContext, RoutePoker};
use crate::link::{Direction, LinkLayer, LinkMessage, LinkSession, SessionInfo, SessionState};
use crate::path::PathContext;
use crate::rpc::{RpcError, ServiceNodeRpc};
use crate::time::Millis;

/// A relay contact for a fresh identity, signed at `now`.
pub fn signed_relay(now: Millis) -> (IdentityKey, RouterContact) {
    let key = IdentityKey::generate();
    let mut rc = RouterContact::new(
        key.router_id(),
        EncryptionKey::generate().public_key(),
        DEFAULT_NETID,
    );
    let port: u16 = rand::thread_rng().gen_range(1024..u16::MAX);
    rc.addrs.push(AddressInfo {
        addr: SocketAddr::from(([10, 0, 0, 1], port)),
        transport_key: EncryptionKey::generate().public_key(),
        rank: 0,
    });
    rc.router_version = Some(RouterVersion::current());
    rc.last_updated = now;
    if rc.sign(&key).is_err() {
        panic!("fresh relay contact must sign");
    }
    (key, rc)
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LinkState {
    sessions: Vec<SessionInfo>,
    inbound: Vec<SocketAddr>,
    outbound: Option<SocketAddr>,
    fail_inbound_bind: bool,
    refuse_establish: bool,
    started: bool,
    stopped: bool,
    pumps: usize,
    attempts: Vec<RouterId>,
    closed: Vec<RouterId>,
    renegotiated: Vec<RouterId>,
    sent: Vec<(RouterId, LinkMessage)>,
    persist_checks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn add_session(&self, peer: RouterId, direction: Direction, state: SessionState, relay: bool) {
        self.state.lock().sessions.push(SessionInfo {
            peer,
            direction,
            state,
            is_relay: relay,
            remote_addr: None,
            last_active: 0,
            tx_rate: 100,
            rx_rate: 50,
        });
    }

    pub fn set_state(&self, peer: &RouterId, state: SessionState) {
        for s in self.state.lock().sessions.iter_mut().filter(|s| s.peer == *peer) {
            s.state = state;
        }
    }

    pub fn fail_inbound_bind(&self, fail: bool) {
        self.state.lock().fail_inbound_bind = fail;
    }

    pub fn refuse_establish(&self, refuse: bool) {
        self.state.lock().refuse_establish = refuse;
    }

    pub fn establish_attempts(&self) -> Vec<RouterId> {
        self.state.lock().attempts.clone()
    }

    pub fn closed(&self) -> Vec<RouterId> {
        self.state.lock().closed.clone()
    }

    pub fn renegotiated(&self) -> Vec<RouterId> {
        self.state.lock().renegotiated.clone()
    }

    pub fn sent_messages(&self) -> Vec<(RouterId, LinkMessage)> {
        self.state.lock().sent.clone()
    }

    pub fn inbound(&self) -> Vec<SocketAddr> {
        self.state.lock().inbound.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn persist_checks(&self) -> usize {
        self.state.lock().persist_checks
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

impl LinkLayer for MockLink {
    fn configure_inbound(&mut self, bind: SocketAddr) -> bool {
        let mut state = self.state.lock();
        if state.fail_inbound_bind {
            return false;
        }
        state.inbound.push(bind);
        true
    }

    fn configure_outbound(&mut self, bind: SocketAddr) -> bool {
        self.state.lock().outbound = Some(bind);
        true
    }

    fn inbound_addresses(&self) -> Vec<SocketAddr> {
        self.state.lock().inbound.clone()
    }

    fn start(&mut self) -> bool {
        self.state.lock().started = true;
        true
    }

    fn stop(&mut self) {
        self.state.lock().stopped = true;
    }

    fn pump(&mut self) {
        self.state.lock().pumps += 1;
    }

    fn try_establish_to(&mut self, rc: &RouterContact) -> bool {
        let mut state = self.state.lock();
        state.attempts.push(rc.pubkey);
        if state.refuse_establish {
            return false;
        }
        state.sessions.push(SessionInfo {
            peer: rc.pubkey,
            direction: Direction::Outbound,
            state: SessionState::Pending,
            is_relay: rc.is_public_router(),
            remote_addr: rc.addrs.first().map(|a| a.addr),
            last_active: 0,
            tx_rate: 0,
            rx_rate: 0,
        });
        true
    }

    fn close_session_to(&mut self, peer: &RouterId) {
        let mut state = self.state.lock();
        state.sessions.retain(|s| s.peer != *peer);
        state.closed.push(*peer);
    }

    fn renegotiate_session(&mut self, peer: &RouterId) -> bool {
        self.state.lock().renegotiated.push(*peer);
        true
    }

    fn send_to(&mut self, peer: &RouterId, message: LinkMessage) -> bool {
        self.state.lock().sent.push((*peer, message));
        true
    }

    fn for_each_peer(&self, visit: &mut dyn FnMut(&dyn LinkSession)) {
        let sessions = self.state.lock().sessions.clone();
        for session in &sessions {
            visit(session);
        }
    }

    fn persist_session_until(&mut self, _peer: &RouterId, _until: Millis) {}

    fn check_persisting_sessions(&mut self, _now: Millis) {
        self.state.lock().persist_checks += 1;
    }
}

// ---------------------------------------------------------------------------
// DHT
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DhtState {
    us: Option<RouterId>,
    stopped: bool,
    transit: bool,
    nodes: HashMap<RouterId, RouterContact>,
    lookups: HashMap<RouterId, Vec<oneshot::Sender<Vec<RouterContact>>>>,
    lookups_started: usize,
    explores: Vec<oneshot::Sender<Vec<RouterContact>>>,
    explores_started: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockDht {
    state: Arc<Mutex<DhtState>>,
}

impl MockDht {
    pub fn lookups_started(&self) -> usize {
        self.state.lock().lookups_started
    }

    pub fn explores_started(&self) -> usize {
        self.state.lock().explores_started
    }

    pub fn answer_lookup(&self, target: &RouterId, found: Vec<RouterContact>) {
        let waiters = self.state.lock().lookups.remove(target).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(found.clone());
        }
    }

    pub fn answer_explores(&self, found: Vec<RouterContact>) {
        let waiters = std::mem::take(&mut self.state.lock().explores);
        for tx in waiters {
            let _ = tx.send(found.clone());
        }
    }

    pub fn drop_lookups(&self) {
        self.state.lock().lookups.clear();
    }

    pub fn started_as(&self) -> Option<RouterId> {
        self.state.lock().us
    }

    pub fn allows_transit(&self) -> bool {
        self.state.lock().transit
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl DhtContext for MockDht {
    fn start(&mut self, us: RouterId) {
        self.state.lock().us = Some(us);
    }

    fn stop(&mut self) {
        self.state.lock().stopped = true;
    }

    fn allow_transit(&mut self) {
        self.state.lock().transit = true;
    }

    fn put_node(&mut self, rc: RouterContact) {
        self.state.lock().nodes.insert(rc.pubkey, rc);
    }

    fn del_node(&mut self, id: &RouterId) {
        self.state.lock().nodes.remove(id);
    }

    fn has_node(&self, id: &RouterId) -> bool {
        self.state.lock().nodes.contains_key(id)
    }

    fn remove_nodes_if(&mut self, pred: &dyn Fn(&RouterId) -> bool) -> usize {
        let mut state = self.state.lock();
        let before = state.nodes.len();
        state.nodes.retain(|id, _| !pred(id));
        before - state.nodes.len()
    }

    fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    fn lookup_router(&mut self, target: RouterId) -> LookupReply {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.lookups_started += 1;
        state.lookups.entry(target).or_default().push(tx);
        rx
    }

    fn explore_via(&mut self, _via: RouterId) -> LookupReply {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.explores_started += 1;
        state.explores.push(tx);
        rx
    }

    fn extract_status(&self) -> Value {
        json!({ "nodes": self.state.lock().nodes.len() })
    }
}

// ---------------------------------------------------------------------------
// Paths, endpoints, routes
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PathState {
    transit: bool,
    ticks: usize,
    expired: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockPaths {
    state: Arc<Mutex<PathState>>,
}

impl MockPaths {
    pub fn allows_transit(&self) -> bool {
        self.state.lock().transit
    }

    pub fn expire_calls(&self) -> usize {
        self.state.lock().expired
    }

    pub fn ticks(&self) -> usize {
        self.state.lock().ticks
    }
}

impl PathContext for MockPaths {
    fn allow_transit(&mut self) {
        self.state.lock().transit = true;
    }

    fn pump_upstream(&mut self) {}

    fn pump_downstream(&mut self) {}

    fn tick(&mut self, _now: Millis) {
        self.state.lock().ticks += 1;
    }

    fn expire_paths(&mut self, _now: Millis) {
        self.state.lock().expired += 1;
    }

    fn transit_path_count(&self) -> usize {
        0
    }

    fn owned_path_count(&self) -> usize {
        3
    }

    fn build_stats(&self) -> (u64, u64) {
        (3, 5)
    }

    fn extract_status(&self) -> Value {
        json!({})
    }
}

#[derive(Debug, Default)]
struct HsState {
    started: bool,
    stopped: bool,
    fail_start: bool,
    thaws: usize,
    ticks: usize,
    has_exit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockHiddenServices {
    state: Arc<Mutex<HsState>>,
}

impl MockHiddenServices {
    pub fn thaws(&self) -> usize {
        self.state.lock().thaws
    }

    pub fn set_has_exit(&self, has_exit: bool) {
        self.state.lock().has_exit = has_exit;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl HiddenServiceContext for MockHiddenServices {
    fn start_all(&mut self) -> bool {
        let mut state = self.state.lock();
        state.started = !state.fail_start;
        state.started
    }

    fn stop_all(&mut self) {
        self.state.lock().stopped = true;
    }

    fn tick(&mut self, _now: Millis) {
        self.state.lock().ticks += 1;
    }

    fn pump(&mut self) {}

    fn thaw_all(&mut self) {
        self.state.lock().thaws += 1;
    }

    fn has_exit(&self) -> bool {
        self.state.lock().has_exit
    }

    fn extract_status(&self) -> Value {
        json!({ "endpoints": 0 })
    }
}

#[derive(Debug, Default)]
struct ExitState {
    default_added: bool,
    stopped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockExit {
    state: Arc<Mutex<ExitState>>,
}

impl MockExit {
    pub fn default_added(&self) -> bool {
        self.state.lock().default_added
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl ExitContext for MockExit {
    fn add_default_endpoint(&mut self) -> bool {
        self.state.lock().default_added = true;
        true
    }

    fn tick(&mut self, _now: Millis) {}

    fn stop(&mut self) {
        self.state.lock().stopped = true;
    }

    fn extract_status(&self) -> Value {
        json!({})
    }
}

#[derive(Debug, Default)]
struct PokerState {
    enabled: bool,
    updates: usize,
    routes: HashSet<IpAddr>,
    removed: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct MockRoutePoker {
    state: Arc<Mutex<PokerState>>,
}

impl MockRoutePoker {
    pub fn updates(&self) -> usize {
        self.state.lock().updates
    }

    pub fn has_route(&self, ip: &IpAddr) -> bool {
        self.state.lock().routes.contains(ip)
    }

    pub fn removed(&self) -> Vec<IpAddr> {
        self.state.lock().removed.clone()
    }
}

impl RoutePoker for MockRoutePoker {
    fn enable(&mut self) {
        self.state.lock().enabled = true;
    }

    fn disable(&mut self) {
        self.state.lock().enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn update(&mut self) {
        self.state.lock().updates += 1;
    }

    fn add_route(&mut self, ip: IpAddr) {
        self.state.lock().routes.insert(ip);
    }

    fn del_route(&mut self, ip: IpAddr) {
        let mut state = self.state.lock();
        state.routes.remove(&ip);
        state.removed.push(ip);
    }
}

// ---------------------------------------------------------------------------
// Disk, RPC
// ---------------------------------------------------------------------------

/// Runs jobs on the calling thread.
#[derive(Debug, Default)]
pub struct InlineDiskQueue {
    runs: AtomicUsize,
}

impl InlineDiskQueue {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl DiskQueue for InlineDiskQueue {
    fn enqueue(&self, job: DiskJob) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        job();
    }
}

#[derive(Debug, Default)]
struct RpcState {
    failures_left: u32,
    identity: Option<IdentityKey>,
    identity_calls: u32,
    informed: Vec<(RouterId, bool)>,
}

/// Without an identity every key request fails.
#[derive(Debug, Default)]
pub struct MockRpc {
    state: Mutex<RpcState>,
}

impl MockRpc {
    pub fn with_identity(key: IdentityKey) -> Self {
        Self::failing_then(0, key)
    }

    pub fn failing_then(failures: u32, key: IdentityKey) -> Self {
        Self {
            state: Mutex::new(RpcState {
                failures_left: failures,
                identity: Some(key),
                ..RpcState::default()
            }),
        }
    }

    pub fn identity_calls(&self) -> u32 {
        self.state.lock().identity_calls
    }

    pub fn informed(&self) -> Vec<(RouterId, bool)> {
        self.state.lock().informed.clone()
    }
}

impl ServiceNodeRpc for MockRpc {
    fn obtain_identity_key(&self) -> Result<IdentityKey, RpcError> {
        let mut state = self.state.lock();
        state.identity_calls += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(RpcError::Unavailable("connection refused".into()));
        }
        state
            .identity
            .clone()
            .ok_or_else(|| RpcError::Unavailable("no identity registered".into()))
    }

    fn inform_connection(&self, peer: &RouterId, success: bool) {
        self.state.lock().informed.push((*peer, success));
    }

    fn block_height(&self) -> u64 {
        1
    }
}
