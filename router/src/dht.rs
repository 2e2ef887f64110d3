//! DHT seam.
//!
//! The router keeps the DHT's node table in step with its sessions and uses
//! it to find RCs it does not have. Lookups answer on a oneshot channel that
//! the router polls each tick; dropping the receiver abandons the lookup.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::contact::RouterContact;
use crate::crypto::RouterId;

pub type LookupReply = oneshot::Receiver<Vec<RouterContact>>;

pub trait DhtContext: Send {
    fn start(&mut self, us: RouterId);

    fn stop(&mut self);

    /// Service nodes relay DHT traffic for others.
    fn allow_transit(&mut self);

    fn put_node(&mut self, rc: RouterContact);

    fn del_node(&mut self, id: &RouterId);

    fn has_node(&self, id: &RouterId) -> bool;

    fn remove_nodes_if(&mut self, pred: &dyn Fn(&RouterId) -> bool) -> usize;

    fn node_count(&self) -> usize;

    /// Iterative lookup of one router's RC.
    fn lookup_router(&mut self, target: RouterId) -> LookupReply;

    /// Asks `via` for routers it knows.
    fn explore_via(&mut self, via: RouterId) -> LookupReply;

    fn extract_status(&self) -> Value;
}
