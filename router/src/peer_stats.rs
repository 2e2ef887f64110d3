//! # Peer Statistics
//!
//! Connection counters per peer, kept by relays. Updated on every session
//! event, read by operators through the status export, and flushed to a sled
//! tree on the disk queue every [`PEER_DB_FLUSH_INTERVAL`].
//!
//! Only the `peer_stats` tree is written; it lives in the same sled database
//! as the contact store.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use tracing::debug;

use crate::config::{ms, PEER_DB_FLUSH_INTERVAL};
use crate::contact::RouterContact;
use crate::crypto::RouterId;
use crate::nodedb::{StoreError, StoreResult};
use crate::time::Millis;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub connection_attempts: u64,
    pub connection_successes: u64,
    pub connection_timeouts: u64,
    pub connection_failures: u64,
    /// Times we saw this peer gossip an RC.
    pub rcs_received: u64,
    /// `last_updated` of the newest RC seen from this peer.
    pub latest_rc: Millis,
    pub last_seen: Millis,
}

#[derive(Debug)]
pub struct PeerDb {
    db: Db,
    tree: Tree,
    stats: DashMap<RouterId, PeerStats>,
    last_flush: AtomicU64,
}

impl PeerDb {
    pub fn from_db(db: Db) -> StoreResult<Self> {
        let tree = db.open_tree("peer_stats")?;
        let peer_db = Self {
            db,
            tree,
            stats: DashMap::new(),
            last_flush: AtomicU64::new(0),
        };
        peer_db.load()?;
        Ok(peer_db)
    }

    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn load(&self) -> StoreResult<()> {
        for item in self.tree.iter() {
            let (key, value) = item?;
            let Ok(bytes) = <[u8; 32]>::try_from(&key[..]) else {
                continue;
            };
            if let Ok(stats) = bincode::deserialize::<PeerStats>(&value) {
                self.stats.insert(RouterId::from_bytes(bytes), stats);
            }
        }
        Ok(())
    }

    /// Applies `f` to the stats of `peer`, creating them if needed.
    pub fn modify_peer_stats(&self, peer: &RouterId, f: impl FnOnce(&mut PeerStats)) {
        let mut entry = self.stats.entry(*peer).or_default();
        f(entry.value_mut());
    }

    pub fn get(&self, peer: &RouterId) -> Option<PeerStats> {
        self.stats.get(peer).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Records an RC gossiped to us by `rc.pubkey`.
    pub fn handle_gossiped_rc(&self, rc: &RouterContact, now: Millis) {
        self.modify_peer_stats(&rc.pubkey, |stats| {
            stats.rcs_received += 1;
            stats.latest_rc = stats.latest_rc.max(rc.last_updated);
            stats.last_seen = now;
        });
    }

    pub fn should_flush(&self, now: Millis) -> bool {
        now.saturating_sub(self.last_flush.load(Ordering::Relaxed)) >= ms(PEER_DB_FLUSH_INTERVAL)
    }

    /// Marks a flush as scheduled so the next tick does not queue another.
    pub fn mark_flush_scheduled(&self, now: Millis) {
        self.last_flush.store(now, Ordering::Relaxed);
    }

    /// Writes all stats to disk. Runs on the disk queue.
    pub fn flush(&self) -> StoreResult<usize> {
        let mut batch = Batch::default();
        for entry in self.stats.iter() {
            let bytes = bincode::serialize(entry.value())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.insert(entry.key().as_bytes().as_slice(), bytes);
        }
        self.tree.apply_batch(batch)?;
        self.db.flush()?;
        let count = self.stats.len();
        debug!(count, "flushed peer stats");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKey;

    #[test]
    fn counters_accumulate() {
        let db = PeerDb::open_temporary().unwrap();
        let peer = IdentityKey::generate().router_id();
        db.modify_peer_stats(&peer, |s| s.connection_attempts += 1);
        db.modify_peer_stats(&peer, |s| s.connection_attempts += 1);
        db.modify_peer_stats(&peer, |s| s.connection_timeouts += 1);

        let stats = db.get(&peer).unwrap();
        assert_eq!(stats.connection_attempts, 2);
        assert_eq!(stats.connection_timeouts, 1);
    }

    #[test]
    fn flush_interval_is_respected() {
        let db = PeerDb::open_temporary().unwrap();
        let interval = ms(PEER_DB_FLUSH_INTERVAL);
        assert!(db.should_flush(interval));
        db.mark_flush_scheduled(interval);
        assert!(!db.should_flush(interval + 1));
        assert!(db.should_flush(interval * 2));
    }

    #[test]
    fn flushed_stats_reload() {
        let dir = tempfile::tempdir().unwrap();
        let peer = IdentityKey::generate().router_id();
        {
            let db = PeerDb::from_db(sled::open(dir.path()).unwrap()).unwrap();
            db.modify_peer_stats(&peer, |s| s.connection_successes = 9);
            assert_eq!(db.flush().unwrap(), 1);
        }
        let db = PeerDb::from_db(sled::open(dir.path()).unwrap()).unwrap();
        assert_eq!(db.get(&peer).unwrap().connection_successes, 9);
    }
}
