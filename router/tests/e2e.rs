//! End-to-end tests for the murk router core against real files.
//!
//! Everything here goes through the public API: key files, signed contacts,
//! bootstrap lists and the sled-backed stores all live in a temporary data
//! directory, and the router is driven through configure, start, tick and
//! the shutdown phases with in-memory stand-ins for the transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use murk_router::config::{ms, RouterConfig, DEFAULT_NETID, ROUTER_TICK_INTERVAL};
use murk_router::contact::{AddressInfo, BootstrapList, RcManager, RouterContact, RouterVersion};
use murk_router::crypto::{EncryptionKey, IdentityKey, KeyManager, KeyPaths, RouterId};
use murk_router::dht::{DhtContext, LookupReply};
use murk_router::disk::{DiskJob, DiskQueue};
use murk_router::endpoint::{ExitContext, HiddenServiceContext, RoutePoker};
use murk_router::link::{LinkEvent, LinkLayer, LinkMessage, LinkSession};
use murk_router::nodedb::{ContactStore, NodeDb};
use murk_router::path::PathContext;
use murk_router::peer_stats::PeerDb;
use murk_router::profiling::RouterProfiling;
use murk_router::time::{now_ms, Millis};
use murk_router::{Collaborators, Router, RouterError};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn relay_contact(now: Millis) -> RouterContact {
    let key = IdentityKey::generate();
    let mut rc = RouterContact::new(
        key.router_id(),
        EncryptionKey::generate().public_key(),
        DEFAULT_NETID,
    );
    rc.addrs.push(AddressInfo {
        addr: SocketAddr::from(([198, 51, 100, 20], 1090)),
        transport_key: EncryptionKey::generate().public_key(),
        rank: 0,
    });
    rc.router_version = Some(RouterVersion::current());
    rc.last_updated = now;
    rc.sign(&key).expect("sign relay contact");
    rc
}

/// Link layer that never completes a handshake and records every attempt.
#[derive(Clone, Default)]
struct RecordingLink {
    attempts: Arc<Mutex<Vec<RouterId>>>,
    inbound: Arc<Mutex<Vec<SocketAddr>>>,
    stopped: Arc<Mutex<bool>>,
}

impl LinkLayer for RecordingLink {
    fn configure_inbound(&mut self, bind: SocketAddr) -> bool {
        self.inbound.lock().push(bind);
        true
    }

    fn configure_outbound(&mut self, _bind: SocketAddr) -> bool {
        true
    }

    fn inbound_addresses(&self) -> Vec<SocketAddr> {
        self.inbound.lock().clone()
    }

    fn start(&mut self) -> bool {
        true
    }

    fn stop(&mut self) {
        *self.stopped.lock() = true;
    }

    fn pump(&mut self) {}

    fn try_establish_to(&mut self, rc: &RouterContact) -> bool {
        self.attempts.lock().push(rc.pubkey);
        true
    }

    fn close_session_to(&mut self, _peer: &RouterId) {}

    fn renegotiate_session(&mut self, _peer: &RouterId) -> bool {
        false
    }

    fn send_to(&mut self, _peer: &RouterId, _message: LinkMessage) -> bool {
        false
    }

    fn for_each_peer(&self, _visit: &mut dyn FnMut(&dyn LinkSession)) {}

    fn persist_session_until(&mut self, _peer: &RouterId, _until: Millis) {}

    fn check_persisting_sessions(&mut self, _now: Millis) {}
}

#[derive(Default)]
struct QuietDht {
    nodes: Vec<RouterId>,
}

impl DhtContext for QuietDht {
    fn start(&mut self, _us: RouterId) {}

    fn stop(&mut self) {}

    fn allow_transit(&mut self) {}

    fn put_node(&mut self, rc: RouterContact) {
        if !self.nodes.contains(&rc.pubkey) {
            self.nodes.push(rc.pubkey);
        }
    }

    fn del_node(&mut self, id: &RouterId) {
        self.nodes.retain(|n| n != id);
    }

    fn has_node(&self, id: &RouterId) -> bool {
        self.nodes.contains(id)
    }

    fn remove_nodes_if(&mut self, pred: &dyn Fn(&RouterId) -> bool) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|n| !pred(n));
        before - self.nodes.len()
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn lookup_router(&mut self, _target: RouterId) -> LookupReply {
        tokio::sync::oneshot::channel().1
    }

    fn explore_via(&mut self, _via: RouterId) -> LookupReply {
        tokio::sync::oneshot::channel().1
    }

    fn extract_status(&self) -> Value {
        json!({ "nodes": self.nodes.len() })
    }
}

struct NoPaths;

impl PathContext for NoPaths {
    fn allow_transit(&mut self) {}
    fn pump_upstream(&mut self) {}
    fn pump_downstream(&mut self) {}
    fn tick(&mut self, _now: Millis) {}
    fn expire_paths(&mut self, _now: Millis) {}

    fn transit_path_count(&self) -> usize {
        0
    }

    fn owned_path_count(&self) -> usize {
        0
    }

    fn build_stats(&self) -> (u64, u64) {
        (0, 0)
    }

    fn extract_status(&self) -> Value {
        Value::Null
    }
}

struct NoServices;

impl HiddenServiceContext for NoServices {
    fn start_all(&mut self) -> bool {
        true
    }

    fn stop_all(&mut self) {}
    fn tick(&mut self, _now: Millis) {}
    fn pump(&mut self) {}
    fn thaw_all(&mut self) {}

    fn has_exit(&self) -> bool {
        false
    }

    fn extract_status(&self) -> Value {
        Value::Null
    }
}

struct NoExits;

impl ExitContext for NoExits {
    fn add_default_endpoint(&mut self) -> bool {
        true
    }

    fn tick(&mut self, _now: Millis) {}
    fn stop(&mut self) {}

    fn extract_status(&self) -> Value {
        Value::Null
    }
}

#[derive(Default)]
struct NoRoutes {
    enabled: bool,
}

impl RoutePoker for NoRoutes {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn update(&mut self) {}
    fn add_route(&mut self, _ip: IpAddr) {}
    fn del_route(&mut self, _ip: IpAddr) {}
}

/// Runs disk jobs on the calling thread so tests can check files right away.
struct SameThreadDisk;

impl DiskQueue for SameThreadDisk {
    fn enqueue(&self, job: DiskJob) {
        job();
    }
}

fn collaborators(
    link: &RecordingLink,
    store: Arc<NodeDb>,
    peer_stats: Option<Arc<PeerDb>>,
) -> Collaborators {
    Collaborators {
        link: Box::new(link.clone()),
        store,
        dht: Box::new(QuietDht::default()),
        paths: Box::new(NoPaths),
        hidden_services: Box::new(NoServices),
        exits: Box::new(NoExits),
        route_poker: Box::new(NoRoutes::default()),
        disk: Arc::new(SameThreadDisk),
        rpc: None,
        peer_stats,
    }
}

fn relay_config(dir: &TempDir) -> RouterConfig {
    let mut config = RouterConfig::default();
    config.router.data_dir = dir.path().to_path_buf();
    config.router.is_relay = true;
    config.router.nickname = "e2e-relay".into();
    config.router.public_addr = Some("203.0.113.7:1090".parse().unwrap());
    config.bootstrap.seed_node = true;
    config
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[test]
fn key_files_survive_reload() {
    let dir = TempDir::new().unwrap();
    let paths = KeyPaths::in_dir(dir.path());

    let first = KeyManager::load_or_generate(paths.clone()).unwrap();
    assert!(paths.identity.exists());
    assert!(paths.encryption.exists());
    assert!(paths.transport.exists());

    let second = KeyManager::load_or_generate(paths).unwrap();
    assert_eq!(first.router_id(), second.router_id());
    assert_eq!(
        first.transport().public_key(),
        second.transport().public_key()
    );
}

#[cfg(unix)]
#[test]
fn key_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let paths = KeyPaths::in_dir(dir.path());
    KeyManager::load_or_generate(paths.clone()).unwrap();
    let mode = std::fs::metadata(&paths.identity).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

// ---------------------------------------------------------------------------
// Contacts And Bootstrap Files
// ---------------------------------------------------------------------------

#[test]
fn signed_contact_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let keys = KeyManager::load_or_generate(KeyPaths::in_dir(dir.path())).unwrap();
    let transport_key = keys.transport().public_key();
    let mut manager = RcManager::new(keys, DEFAULT_NETID);
    let candidate = manager.prepare(
        "disk",
        vec![AddressInfo {
            addr: "203.0.113.9:1090".parse().unwrap(),
            transport_key,
            rank: 0,
        }],
        true,
    );
    manager.sign_and_commit(candidate, now).unwrap();

    let path = dir.path().join("self.signed");
    manager.current().write_file(&path).unwrap();
    let loaded = RouterContact::read_file(&path).unwrap();
    assert_eq!(&loaded, manager.current());
    assert!(loaded.verify(now, DEFAULT_NETID).is_ok());
    assert!(loaded.verify(now, "testnet").is_err());
}

#[test]
fn tampered_contact_file_fails_verification() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let path = dir.path().join("relay.signed");
    relay_contact(now).write_file(&path).unwrap();

    let mut raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    raw["nickname"] = json!("mallory");
    std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

    let loaded = RouterContact::read_file(&path).unwrap();
    assert!(loaded.verify(now, DEFAULT_NETID).is_err());
}

#[test]
fn bootstrap_list_accepts_single_contacts_and_lists() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let single = dir.path().join("one.signed");
    let one = relay_contact(now);
    one.write_file(&single).unwrap();

    let list_path = dir.path().join("many.signed");
    let many = BootstrapList::from_contacts([relay_contact(now), relay_contact(now)]);
    many.write_file(&list_path).unwrap();

    assert_eq!(BootstrapList::read_file(&single).unwrap(), vec![one]);
    assert_eq!(BootstrapList::read_file(&list_path).unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[test]
fn nodedb_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let kept = relay_contact(now);
    let dropped = relay_contact(now);
    {
        let db = NodeDb::open(dir.path().join("nodedb")).unwrap();
        assert!(db.put(kept.clone()));
        assert!(db.put(dropped.clone()));
        db.save_to_disk().unwrap();
        assert!(db.remove(&dropped.pubkey));
        db.save_to_disk().unwrap();
    }

    let db = NodeDb::open(dir.path().join("nodedb")).unwrap();
    assert_eq!(db.load_from_disk().unwrap(), 1);
    assert_eq!(db.get(&kept.pubkey), Some(kept));
    assert!(!db.has(&dropped.pubkey));
}

#[test]
fn peer_stats_flush_and_reload() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let rc = relay_contact(now);
    {
        let stats = PeerDb::from_db(sled::open(dir.path().join("peers")).unwrap()).unwrap();
        stats.handle_gossiped_rc(&rc, now);
        stats.handle_gossiped_rc(&rc, now + 1);
        assert_eq!(stats.flush().unwrap(), 1);
    }

    let stats = PeerDb::from_db(sled::open(dir.path().join("peers")).unwrap()).unwrap();
    let loaded = stats.get(&rc.pubkey).unwrap();
    assert_eq!(loaded.rcs_received, 2);
    assert_eq!(loaded.latest_rc, now);
    assert_eq!(loaded.last_seen, now + 1);
}

#[test]
fn profiles_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profiles.dat");
    let now = now_ms();
    let peer = IdentityKey::generate().router_id();

    let profiling = RouterProfiling::new();
    profiling.mark_connect_timeout(&peer, now);
    profiling.mark_path_success(&peer, now);
    profiling.save(&path).unwrap();

    let reloaded = RouterProfiling::new();
    assert_eq!(reloaded.load(&path).unwrap(), 1);
    assert_eq!(reloaded.get(&peer), profiling.get(&peer));
}

#[test]
fn config_file_fills_in_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("router.json");
    std::fs::write(
        &path,
        r#"{ "router": { "is_relay": true, "nickname": "fromfile" }, "consensus": { "whitelist_routers": true } }"#,
    )
    .unwrap();

    let config = RouterConfig::from_json_file(&path).unwrap();
    assert!(config.router.is_relay);
    assert_eq!(config.router.nickname, "fromfile");
    assert_eq!(config.router.netid, DEFAULT_NETID);
    assert!(config.whitelist_mode());
    assert!(RouterConfig::from_json_file(&dir.path().join("missing.json")).is_err());
}

// ---------------------------------------------------------------------------
// Router Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn relay_writes_its_contact_and_keeps_identity_across_restarts() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let store = Arc::new(NodeDb::open_temporary().unwrap());
    let link = RecordingLink::default();

    let mut router =
        Router::configure(relay_config(&dir), collaborators(&link, store.clone(), None), now)
            .unwrap();
    router.start(now).unwrap();
    assert_eq!(
        link.inbound_addresses(),
        vec!["0.0.0.0:1090".parse::<SocketAddr>().unwrap()]
    );

    let saved = RouterContact::read_file(&dir.path().join("self.signed")).unwrap();
    assert_eq!(&saved, router.rc());
    assert!(saved.is_public_router());
    assert_eq!(saved.addrs[0].addr, "203.0.113.7:1090".parse().unwrap());
    let id = router.router_id();

    assert!(router.stop());
    router.after_stop_issued();
    router.close();
    drop(router);

    let later = now + 1_000;
    let mut router =
        Router::configure(relay_config(&dir), collaborators(&link, store, None), later).unwrap();
    router.start(later).unwrap();
    assert_eq!(router.router_id(), id);
    assert!(router.rc().last_updated >= saved.last_updated);
}

#[test]
fn client_bootstraps_from_data_dir_and_saves_contacts_on_stop() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let seeds = BootstrapList::from_contacts([relay_contact(now), relay_contact(now)]);
    seeds
        .write_file(&dir.path().join("bootstrap.signed"))
        .unwrap();

    let mut config = RouterConfig::default();
    config.router.data_dir = dir.path().to_path_buf();
    let nodedb_path = config.nodedb_path();
    let link = RecordingLink::default();
    {
        let store = Arc::new(NodeDb::open(&nodedb_path).unwrap());
        let stats = Arc::new(PeerDb::from_db(store.db().clone()).unwrap());
        let mut router =
            Router::configure(config, collaborators(&link, store.clone(), Some(stats)), now)
                .unwrap();
        assert_eq!(router.bootstrap().len(), 2);
        router.start(now).unwrap();
        assert!(!router.is_service_node());
        assert_eq!(store.count_loaded(), 2);

        let mut t = now;
        for _ in 0..4 {
            t += ms(ROUTER_TICK_INTERVAL);
            router.tick(t);
        }
        let attempts = link.attempts.lock().clone();
        assert!(seeds.ids().all(|id| attempts.contains(id)));

        assert!(router.stop());
        router.after_stop_issued();
        router.close();
        assert!(*link.stopped.lock());
        assert!(router.is_closed());
    }

    let store = NodeDb::open(&nodedb_path).unwrap();
    assert_eq!(store.load_from_disk().unwrap(), 2);
    assert!(seeds.ids().all(|id| store.has(id)));
}

#[test]
fn unreadable_bootstrap_file_stops_configure() {
    let dir = TempDir::new().unwrap();
    let bad = dir.path().join("broken.signed");
    std::fs::write(&bad, b"not json").unwrap();

    let mut config = RouterConfig::default();
    config.router.data_dir = dir.path().to_path_buf();
    config.bootstrap.files = vec![bad];
    let link = RecordingLink::default();
    let store = Arc::new(NodeDb::open_temporary().unwrap());
    assert!(Router::configure(config, collaborators(&link, store, None), now_ms()).is_err());
}

#[test]
fn client_without_bootstrap_is_refused() {
    let dir = TempDir::new().unwrap();
    let mut config = RouterConfig::default();
    config.router.data_dir = dir.path().to_path_buf();
    let link = RecordingLink::default();
    let store = Arc::new(NodeDb::open_temporary().unwrap());
    assert!(matches!(
        Router::configure(config, collaborators(&link, store, None), now_ms()),
        Err(RouterError::NoBootstrap)
    ));
}

#[test]
fn gossiped_contacts_land_in_the_store() {
    let dir = TempDir::new().unwrap();
    let now = now_ms();
    let store = Arc::new(NodeDb::open_temporary().unwrap());
    let link = RecordingLink::default();
    let mut router =
        Router::configure(relay_config(&dir), collaborators(&link, store.clone(), None), now)
            .unwrap();
    router.start(now).unwrap();

    let rc = relay_contact(now);
    router.handle_event(
        LinkEvent::GossipReceived {
            from: rc.pubkey,
            rc: rc.clone(),
        },
        now,
    );
    assert_eq!(store.get(&rc.pubkey), Some(rc));

    let status = router.extract_status();
    assert_eq!(status["running"], true);
    assert_eq!(status["numNodesKnown"], 1);
}
