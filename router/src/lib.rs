// Copyright (c) 2026 Murk Developers. MIT License.
// See LICENSE for details.

//! # Murk Router: Control Core
//!
//! The orchestration layer of a murk onion-routing node. Whether the node runs
//! as a relay (service node) or as a client, everything it decides about the
//! network is decided here: which identity it publishes, which peers it talks
//! to, when it announces itself, and which peers the service-node consensus
//! still trusts.
//!
//! Wire transport, the DHT, path cryptography and hidden-service endpoints are
//! not implemented in this crate. They plug in through the traits in [`link`],
//! [`dht`], [`path`], [`endpoint`], [`disk`] and [`rpc`], and the orchestrator
//! drives them from a single periodic tick.
//!
//! ## Architecture
//!
//! - **crypto**: Identity, encryption and transport keys, plus key files.
//! - **contact**: Router contacts (RCs), bootstrap lists, and the RC manager
//!   that signs and rotates our own contact.
//! - **nodedb**: The contact store (sled-backed, DashMap-cached).
//! - **peer_stats / profiling**: Per-peer connection statistics.
//! - **session_maker**: Admission-controlled outbound session creation.
//! - **rc_lookup**: RC resolution and whitelist/greylist consensus gating.
//! - **gossip**: Replay-suppressed broadcast of our own RC.
//! - **reachability**: Service-node reachability testing.
//! - **router**: The tick state machine that owns all of the above.
//! - **driver**: Tokio timers and shutdown sequencing around the router.
//! - **config / metrics / time**: Constants, typed config, Prometheus
//!   counters and the millisecond clock.
//!
//! ## Threading
//!
//! The [`Router`] itself is a plain struct with `&mut self` methods. The
//! [`RouterHandle`] puts it behind one mutex, so the tick, link events and
//! timer callbacks are serialized. Disk work leaves that lock through the
//! [`disk::DiskQueue`]; results come back through channels polled each tick.

pub mod config;
pub mod contact;
pub mod crypto;
pub mod dht;
pub mod disk;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod gossip;
pub mod link;
pub mod metrics;
pub mod nodedb;
pub mod path;
pub mod peer_stats;
pub mod profiling;
pub mod rc_lookup;
pub mod reachability;
pub mod router;
pub mod rpc;
pub mod session_maker;
pub mod time;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::RouterConfig;
pub use contact::{BootstrapList, RcManager, RouterContact};
pub use crypto::{EncryptionKey, IdentityKey, RouterId};
pub use driver::RouterHandle;
pub use error::RouterError;
pub use router::{Collaborators, Router};
