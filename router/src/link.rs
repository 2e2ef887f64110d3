//! # Link Session Layer
//!
//! The router never speaks the wire protocol. It tells the link layer whom to
//! connect to, whom to drop, and what to send, and learns about session
//! changes through [`LinkEvent`]s delivered on a channel.
//!
//! A session is seen through [`LinkSession`]: a peer key, a direction and an
//! explicit [`SessionState`]. The router never holds on to a session; it
//! looks peers up by key each time it needs one.

use std::net::SocketAddr;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::contact::RouterContact;
use crate::crypto::RouterId;
use crate::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Read-only view of one link session.
pub trait LinkSession {
    fn peer(&self) -> RouterId;
    fn direction(&self) -> Direction;
    fn state(&self) -> SessionState;
    /// The remote advertised a relay RC.
    fn is_relay(&self) -> bool;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn last_active(&self) -> Millis;
    fn tx_rate(&self) -> u64;
    fn rx_rate(&self) -> u64;

    fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }
}

/// A plain snapshot of a session. Link implementations may hand these out
/// from [`LinkLayer::for_each_peer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub peer: RouterId,
    pub direction: Direction,
    pub state: SessionState,
    pub is_relay: bool,
    pub remote_addr: Option<SocketAddr>,
    pub last_active: Millis,
    pub tx_rate: u64,
    pub rx_rate: u64,
}

impl LinkSession for SessionInfo {
    fn peer(&self) -> RouterId {
        self.peer
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn is_relay(&self) -> bool {
        self.is_relay
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn last_active(&self) -> Millis {
        self.last_active
    }

    fn tx_rate(&self) -> u64 {
        self.tx_rate
    }

    fn rx_rate(&self) -> u64 {
        self.rx_rate
    }
}

/// Control-plane messages the router asks the link layer to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    GossipRc(RouterContact),
}

/// Session lifecycle and control traffic reported by the link layer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A session finished its handshake. `rc` is the remote's contact when
    /// it presented one.
    Established {
        peer: RouterId,
        inbound: bool,
        rc: Option<RouterContact>,
    },
    /// An outbound attempt gave up before the handshake completed.
    TimedOut { peer: RouterId },
    /// A session is fully closed.
    Closed { peer: RouterId },
    /// `from` gossiped an RC to us.
    GossipReceived { from: RouterId, rc: RouterContact },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

pub fn event_channel() -> (LinkEventSender, LinkEventReceiver) {
    mpsc::unbounded_channel()
}

/// Everything the router needs from the transport.
pub trait LinkLayer: Send {
    /// Binds an inbound listener. `false` means the bind failed.
    fn configure_inbound(&mut self, bind: SocketAddr) -> bool;

    /// Binds the outbound socket.
    fn configure_outbound(&mut self, bind: SocketAddr) -> bool;

    /// Addresses our inbound listeners are reachable on.
    fn inbound_addresses(&self) -> Vec<SocketAddr>;

    fn start(&mut self) -> bool;

    fn stop(&mut self);

    /// Flushes queued outbound traffic.
    fn pump(&mut self);

    /// Starts a handshake with `rc`. `false` when the attempt could not even
    /// be started; otherwise the outcome arrives as a [`LinkEvent`].
    fn try_establish_to(&mut self, rc: &RouterContact) -> bool;

    fn close_session_to(&mut self, peer: &RouterId);

    /// Re-runs the handshake so the peer picks up our new RC.
    fn renegotiate_session(&mut self, peer: &RouterId) -> bool;

    fn send_to(&mut self, peer: &RouterId, message: LinkMessage) -> bool;

    fn for_each_peer(&self, visit: &mut dyn FnMut(&dyn LinkSession));

    /// Keeps the session to `peer` open until `until` even when idle.
    fn persist_session_until(&mut self, peer: &RouterId, until: Millis);

    /// Renews sessions whose persistence deadline has not passed.
    fn check_persisting_sessions(&mut self, now: Millis);

    fn has_session_to(&self, peer: &RouterId) -> bool {
        let mut found = false;
        self.for_each_peer(&mut |s| {
            found |= s.peer() == *peer && s.is_established();
        });
        found
    }

    fn has_pending_session_to(&self, peer: &RouterId) -> bool {
        let mut found = false;
        self.for_each_peer(&mut |s| {
            found |= s.peer() == *peer && s.state() == SessionState::Pending;
        });
        found
    }

    /// Established sessions to relays.
    fn num_connected_routers(&self) -> usize {
        let mut count = 0;
        self.for_each_peer(&mut |s| {
            if s.is_established() && s.is_relay() {
                count += 1;
            }
        });
        count
    }

    /// Established inbound sessions from clients.
    fn num_connected_clients(&self) -> usize {
        let mut count = 0;
        self.for_each_peer(&mut |s| {
            if s.is_established() && !s.is_relay() && s.direction() == Direction::Inbound {
                count += 1;
            }
        });
        count
    }

    fn num_pending(&self) -> usize {
        let mut count = 0;
        self.for_each_peer(&mut |s| {
            if s.state() == SessionState::Pending {
                count += 1;
            }
        });
        count
    }

    /// Sessions grouped by state, with byte rates.
    fn extract_status(&self) -> Value {
        let mut established = Vec::new();
        let mut pending = Vec::new();
        self.for_each_peer(&mut |s| {
            let entry = json!({
                "peer": s.peer().to_hex(),
                "direction": s.direction(),
                "relay": s.is_relay(),
                "remote": s.remote_addr().map(|a| a.to_string()),
                "lastActive": s.last_active(),
                "tx": s.tx_rate(),
                "rx": s.rx_rate(),
            });
            match s.state() {
                SessionState::Established => established.push(entry),
                SessionState::Pending => pending.push(entry),
                SessionState::Closed => {}
            }
        });
        json!({ "sessions": { "established": established, "pending": pending } })
    }
}
