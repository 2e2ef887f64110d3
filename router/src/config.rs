//! # Router Configuration & Constants
//!
//! Every timing constant the control core relies on lives here, next to the
//! typed configuration the orchestrator is built from. Operators never edit
//! these constants; they tune [`RouterConfig`] instead.
//!
//! The configuration struct is only a carrier. Parsing an operator-facing
//! format (and validating it beyond what the orchestrator itself checks at
//! `configure()` time) is the job of whoever embeds the router.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contact::RouterContact;
use crate::crypto::RouterId;

// ---------------------------------------------------------------------------
// Protocol Identifiers
// ---------------------------------------------------------------------------

/// Network identifier embedded in every RC. Contacts from a different netid
/// never verify.
pub const DEFAULT_NETID: &str = "murk";

/// Router software version advertised by relays.
pub const ROUTER_VERSION: [u16; 3] = [0, 1, 0];

/// Link protocol version advertised alongside the router version.
pub const PROTO_VERSION: u8 = 1;

/// Version of the RC record layout itself.
pub const RC_FORMAT_VERSION: u64 = 0;

/// Maximum nickname length in bytes.
pub const MAX_NICKNAME_LEN: usize = 32;

/// Maximum number of addresses one RC may advertise.
pub const MAX_RC_ADDRS: usize = 8;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Interval between two orchestrator ticks.
pub const ROUTER_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// A wall-clock jump larger than this between two ticks (either direction)
/// means our view of the network is stale and all sessions get thawed.
pub const TIMESKIP_THRESHOLD: Duration = Duration::from_secs(60);

/// How long a signed RC stays valid after `last_updated`.
pub const RC_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// A relay re-signs its RC at least this often.
pub const RC_REGEN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Window before expiry in which an RC counts as "expiring soon".
pub const RC_EXPIRES_SOON_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound of the random jitter added to the expiring-soon window.
pub const RC_REGEN_JITTER_MAX: Duration = Duration::from_secs(10);

/// How far into the future an RC's `last_updated` may lie before it is
/// rejected as clock-skewed.
pub const RC_MAX_FUTURE_SKEW: Duration = Duration::from_secs(10 * 60);

/// Network exploration interval for relays.
pub const EXPLORE_INTERVAL_SERVICE_NODE: Duration = Duration::from_secs(5);

/// Network exploration interval for clients.
pub const EXPLORE_INTERVAL_CLIENT: Duration = Duration::from_secs(2);

/// Interval between reachability test rounds (service-node mode).
pub const REACHABILITY_TESTING_INTERVAL: Duration = Duration::from_secs(12);

/// Decommission / deregistration warnings are emitted at most this often.
pub const DECOMMISSION_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Interval of the informational stats report.
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Grace delay between shutdown phases, so close frames can flush.
pub const STOP_GRACE_DELAY: Duration = Duration::from_millis(200);

/// Interval between periodic refresh passes over expiring stored RCs.
pub const RC_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Maximum number of stored RCs re-looked-up per refresh pass.
pub const RC_REFRESH_BATCH: usize = 8;

/// Replay window of the gossip table: one broadcast per key per window.
pub const GOSSIP_REPLAY_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Maximum number of peers a single gossip broadcast reaches.
pub const MAX_GOSSIP_PEERS: usize = 20;

/// Decay window of the path-build limiter.
pub const PATH_BUILD_RATE_LIMIT: Duration = Duration::from_millis(500);

/// Peer statistics are flushed to disk at most this often.
pub const PEER_DB_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Router profiles are saved to disk at most this often.
pub const PROFILE_SAVE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Attempts made to fetch the identity key over service-node RPC.
pub const IDENTITY_FETCH_MAX_TRIES: u32 = 5;

// ---------------------------------------------------------------------------
// File Names
// ---------------------------------------------------------------------------

pub const IDENTITY_KEY_FILE: &str = "identity.private";
pub const ENCRYPTION_KEY_FILE: &str = "encryption.private";
pub const TRANSPORT_KEY_FILE: &str = "transport.private";
pub const OUR_RC_FILE: &str = "self.signed";
pub const DEFAULT_BOOTSTRAP_FILE: &str = "bootstrap.signed";
pub const PROFILES_FILE: &str = "profiles.dat";
pub const NODEDB_DIR: &str = "nodedb";

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

/// Typed configuration for one router instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub router: RouterSection,
    pub network: NetworkSection,
    pub links: LinksSection,
    pub bootstrap: BootstrapSection,
    pub consensus: ConsensusSection,
    pub gossip: GossipSection,
}

/// Identity, relay mode and connectivity targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Run as a relay (service node) rather than a client.
    pub is_relay: bool,
    pub nickname: String,
    pub netid: String,
    pub data_dir: PathBuf,
    /// Keep at least this many router sessions open.
    pub min_connected_routers: usize,
    /// Never open outbound sessions beyond this many.
    pub max_connected_routers: usize,
    /// Publicly reachable address advertised in our RC; overrides whatever
    /// the inbound links report.
    pub public_addr: Option<SocketAddr>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            is_relay: false,
            nickname: String::new(),
            netid: DEFAULT_NETID.to_string(),
            data_dir: PathBuf::from("."),
            min_connected_routers: 4,
            max_connected_routers: 6,
            public_addr: None,
        }
    }
}

/// Client-side network behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Client-only set of routers we are allowed to use as first hop.
    pub strict_connect: BTreeSet<RouterId>,
    pub enable_profiling: bool,
    pub save_profiles: bool,
    /// Run an exit endpoint. Not allowed on service nodes.
    pub exit_enabled: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            strict_connect: BTreeSet::new(),
            enable_profiling: true,
            save_profiles: true,
            exit_enabled: false,
        }
    }
}

/// Link listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinksSection {
    /// Inbound listeners. Relays without any fall back to `public_addr`.
    pub inbound: Vec<SocketAddr>,
    /// Local port for the outbound link (0 = ephemeral).
    pub outbound_port: u16,
}

impl Default for LinksSection {
    fn default() -> Self {
        Self {
            inbound: Vec::new(),
            outbound_port: 0,
        }
    }
}

/// Bootstrap sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    /// Files holding a single signed RC or a list of them.
    pub files: Vec<PathBuf>,
    /// Contacts supplied inline.
    pub routers: Vec<RouterContact>,
    /// A seed node may run with an empty bootstrap set.
    pub seed_node: bool,
}

/// Whitelist consensus participation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// Gate sessions on the service-node whitelist/greylist.
    pub whitelist_routers: bool,
    /// Address of the service-node directory RPC.
    pub rpc_addr: Option<String>,
}

/// Gossip tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSection {
    /// Minimum uptime before the first gossip, in milliseconds.
    pub start_delay_min_ms: u64,
    /// Random spread added on top of `start_delay_min_ms`.
    pub start_delay_spread_ms: u64,
    pub max_peers: usize,
    /// Turns gossip off entirely. Only meant for test networks.
    pub disable_testing_only: bool,
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            start_delay_min_ms: 10_000,
            start_delay_spread_ms: 30_000,
            max_peers: MAX_GOSSIP_PEERS,
            disable_testing_only: false,
        }
    }
}

impl RouterConfig {
    /// Loads a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// True when sessions are gated on the consensus lists.
    pub fn whitelist_mode(&self) -> bool {
        self.router.is_relay && self.consensus.whitelist_routers
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.router.data_dir.join(IDENTITY_KEY_FILE)
    }

    pub fn encryption_key_path(&self) -> PathBuf {
        self.router.data_dir.join(ENCRYPTION_KEY_FILE)
    }

    pub fn transport_key_path(&self) -> PathBuf {
        self.router.data_dir.join(TRANSPORT_KEY_FILE)
    }

    pub fn rc_path(&self) -> PathBuf {
        self.router.data_dir.join(OUR_RC_FILE)
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.router.data_dir.join(PROFILES_FILE)
    }

    pub fn nodedb_path(&self) -> PathBuf {
        self.router.data_dir.join(NODEDB_DIR)
    }
}

/// Errors loading a [`RouterConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Converts a [`Duration`] into the millisecond timestamps used throughout
/// the router.
pub const fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
