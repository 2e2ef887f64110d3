//! Hidden-service, exit and client routing seams.
//!
//! None of this is implemented here. The router starts and stops these
//! contexts, ticks them, and on clients decides whether default-route
//! capture is on.

use std::net::IpAddr;

use serde_json::Value;

use crate::time::Millis;

/// The set of hidden-service endpoints this node hosts or uses.
pub trait HiddenServiceContext: Send {
    fn start_all(&mut self) -> bool;

    fn stop_all(&mut self);

    fn tick(&mut self, now: Millis);

    fn pump(&mut self);

    /// Drops endpoint state that went stale while the clock was frozen.
    fn thaw_all(&mut self);

    /// Some endpoint has a usable exit.
    fn has_exit(&self) -> bool;

    fn extract_status(&self) -> Value;
}

/// Exit endpoints hosted by a service node.
pub trait ExitContext: Send {
    fn add_default_endpoint(&mut self) -> bool;

    fn tick(&mut self, now: Millis);

    fn stop(&mut self);

    fn extract_status(&self) -> Value;
}

/// Client-side OS routing: captures the default route while an exit is up
/// and keeps bypass routes to the relays we connect to directly.
pub trait RoutePoker: Send {
    fn enable(&mut self);

    fn disable(&mut self);

    fn is_enabled(&self) -> bool;

    /// Re-applies routes after the gateway may have changed.
    fn update(&mut self);

    fn add_route(&mut self, ip: IpAddr);

    fn del_route(&mut self, ip: IpAddr);
}
