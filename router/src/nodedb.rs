//! # Node Contact Store
//!
//! Every RC the router knows about, other than its own. The orchestrator
//! reads it on every connectivity decision and prunes it each tick.
//!
//! [`ContactStore`] is the seam; [`NodeDb`] is the implementation we ship. It
//! keeps all contacts in a `DashMap` so worker jobs can look contacts up
//! without touching the orchestrator lock, and mirrors them into a sled tree
//! when asked to persist:
//!
//! | Tree       | Key              | Value                   |
//! |------------|------------------|-------------------------|
//! | `contacts` | router id (32B)  | `bincode(RouterContact)`|
//!
//! Disk is only touched by [`ContactStore::load_from_disk`] and
//! [`ContactStore::save_to_disk`], which the router runs at start and stop
//! (the latter through the disk queue).

use dashmap::DashMap;
use sled::{Batch, Db, Tree};
use std::path::Path;
use tracing::{debug, warn};

use crate::contact::RouterContact;
use crate::crypto::RouterId;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors from the sled-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// ContactStore
// ---------------------------------------------------------------------------

/// The contact table as the router core sees it.
pub trait ContactStore: Send + Sync {
    fn get(&self, id: &RouterId) -> Option<RouterContact>;

    /// Stores `rc` unless a newer version is already present. Returns
    /// whether it was stored.
    fn put(&self, rc: RouterContact) -> bool;

    fn remove(&self, id: &RouterId) -> bool;

    /// Removes every contact matching `pred`; returns how many went.
    fn remove_if(&self, pred: &dyn Fn(&RouterContact) -> bool) -> usize;

    fn count_loaded(&self) -> usize;

    /// Snapshot of all contacts.
    fn contacts(&self) -> Vec<RouterContact>;

    fn load_from_disk(&self) -> StoreResult<usize>;

    fn save_to_disk(&self) -> StoreResult<()>;

    fn has(&self, id: &RouterId) -> bool {
        self.get(id).is_some()
    }
}

// ---------------------------------------------------------------------------
// NodeDb
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct NodeDb {
    db: Db,
    tree: Tree,
    cache: DashMap<RouterId, RouterContact>,
}

impl NodeDb {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop. For tests and the CLI.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    /// Opens the `contacts` tree on an existing database, so the peer
    /// statistics can share the same sled instance.
    pub fn from_db(db: Db) -> StoreResult<Self> {
        let tree = db.open_tree("contacts")?;
        Ok(Self {
            db,
            tree,
            cache: DashMap::new(),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

impl ContactStore for NodeDb {
    fn get(&self, id: &RouterId) -> Option<RouterContact> {
        self.cache.get(id).map(|rc| rc.clone())
    }

    fn put(&self, rc: RouterContact) -> bool {
        if let Some(existing) = self.cache.get(&rc.pubkey) {
            if !rc.is_newer_than(&existing) {
                return false;
            }
        }
        self.cache.insert(rc.pubkey, rc);
        true
    }

    fn remove(&self, id: &RouterId) -> bool {
        self.cache.remove(id).is_some()
    }

    fn remove_if(&self, pred: &dyn Fn(&RouterContact) -> bool) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, rc| !pred(rc));
        before - self.cache.len()
    }

    fn count_loaded(&self) -> usize {
        self.cache.len()
    }

    fn contacts(&self) -> Vec<RouterContact> {
        self.cache.iter().map(|e| e.value().clone()).collect()
    }

    fn load_from_disk(&self) -> StoreResult<usize> {
        let mut loaded = 0;
        for item in self.tree.iter() {
            let (key, value) = item?;
            match bincode::deserialize::<RouterContact>(&value) {
                Ok(rc) if rc.pubkey.as_bytes()[..] == key[..] => {
                    if self.put(rc) {
                        loaded += 1;
                    }
                }
                Ok(_) | Err(_) => {
                    warn!("skipping undecodable contact in nodedb");
                }
            }
        }
        debug!(loaded, "loaded contacts from disk");
        Ok(loaded)
    }

    fn save_to_disk(&self) -> StoreResult<()> {
        let mut batch = Batch::default();
        for item in self.tree.iter().keys() {
            let key = item?;
            let known = <[u8; 32]>::try_from(&key[..])
                .map(|bytes| self.cache.contains_key(&RouterId::from_bytes(bytes)))
                .unwrap_or(false);
            if !known {
                batch.remove(key);
            }
        }
        for entry in self.cache.iter() {
            let bytes = bincode::serialize(entry.value())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.insert(entry.key().as_bytes().as_slice(), bytes);
        }
        self.tree.apply_batch(batch)?;
        self.db.flush()?;
        debug!(count = self.cache.len(), "saved contacts to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::signed_relay;
    use crate::time::now_ms;

    #[test]
    fn put_keeps_the_newest_version() {
        let db = NodeDb::open_temporary().unwrap();
        let (_, rc) = signed_relay(now_ms());
        let mut older = rc.clone();
        older.last_updated -= 1;

        assert!(db.put(rc.clone()));
        assert!(!db.put(older));
        assert!(!db.put(rc.clone()), "same version is not newer");
        assert_eq!(db.get(&rc.pubkey), Some(rc));
    }

    #[test]
    fn remove_if_counts_removed() {
        let db = NodeDb::open_temporary().unwrap();
        let now = now_ms();
        let (_, a) = signed_relay(now);
        let (_, mut b) = signed_relay(now);
        b.nickname = "drop-me".into();
        db.put(a.clone());
        db.put(b);

        assert_eq!(db.remove_if(&|rc| rc.nickname == "drop-me"), 1);
        assert_eq!(db.count_loaded(), 1);
        assert!(db.has(&a.pubkey));
    }

    #[test]
    fn contacts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (_, rc) = signed_relay(now_ms());
        {
            let db = NodeDb::open(dir.path()).unwrap();
            db.put(rc.clone());
            db.save_to_disk().unwrap();
        }
        let db = NodeDb::open(dir.path()).unwrap();
        assert_eq!(db.count_loaded(), 0);
        assert_eq!(db.load_from_disk().unwrap(), 1);
        assert_eq!(db.get(&rc.pubkey), Some(rc));
    }

    #[test]
    fn save_drops_removed_contacts_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let now = now_ms();
        let (_, a) = signed_relay(now);
        let (_, b) = signed_relay(now);
        {
            let db = NodeDb::open(dir.path()).unwrap();
            db.put(a.clone());
            db.put(b.clone());
            db.save_to_disk().unwrap();
            db.remove(&b.pubkey);
            db.save_to_disk().unwrap();
        }
        let db = NodeDb::open(dir.path()).unwrap();
        assert_eq!(db.load_from_disk().unwrap(), 1);
        assert!(!db.has(&b.pubkey));
    }
}
