//! # Bootstrap Set
//!
//! The contacts a router trusts to get onto the network before it has
//! discovered anything itself. Sources, in order:
//!
//! 1. Every file listed in `bootstrap.files`. A file whose first
//!    non-whitespace byte is `[` holds a JSON list of RCs; anything else is a
//!    single RC.
//! 2. Contacts given inline in `bootstrap.routers`.
//! 3. If neither was configured, `<data_dir>/bootstrap.signed` when it
//!    exists.
//!
//! After loading, contacts that fail verification are dropped with a
//! warning. The set is fixed from then on.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::router_contact::write_atomic;
use super::{ContactError, RouterContact};
use crate::config::{BootstrapSection, DEFAULT_BOOTSTRAP_FILE};
use crate::crypto::RouterId;
use crate::time::Millis;

/// A deduplicated set of bootstrap contacts keyed by router id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapList {
    contacts: BTreeMap<RouterId, RouterContact>,
}

impl BootstrapList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contacts(contacts: impl IntoIterator<Item = RouterContact>) -> Self {
        let mut list = Self::new();
        for rc in contacts {
            list.insert(rc);
        }
        list
    }

    /// Inserts `rc`, keeping the newer version when the router is already
    /// present.
    pub fn insert(&mut self, rc: RouterContact) {
        match self.contacts.get(&rc.pubkey) {
            Some(existing) if !rc.is_newer_than(existing) => {}
            _ => {
                self.contacts.insert(rc.pubkey, rc);
            }
        }
    }

    /// Reads a bootstrap file holding one RC or a list of them.
    pub fn read_file(path: &Path) -> Result<Vec<RouterContact>, ContactError> {
        let raw = fs::read(path).map_err(|source| ContactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let decode_err = |source| ContactError::Decode {
            path: path.to_path_buf(),
            source,
        };
        let is_list = raw
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'[');
        if is_list {
            serde_json::from_slice(&raw).map_err(decode_err)
        } else {
            serde_json::from_slice(&raw)
                .map(|rc| vec![rc])
                .map_err(decode_err)
        }
    }

    /// Writes the set as a JSON list.
    pub fn write_file(&self, path: &Path) -> Result<(), ContactError> {
        let list: Vec<&RouterContact> = self.contacts.values().collect();
        let json = serde_json::to_vec_pretty(&list).map_err(ContactError::Encode)?;
        write_atomic(path, &json)
    }

    /// Gathers the configured sources. Unreadable files are errors; whether
    /// the result may be empty is the caller's call.
    pub fn load(config: &BootstrapSection, data_dir: &Path) -> Result<Self, ContactError> {
        let mut files: Vec<PathBuf> = config.files.clone();
        if files.is_empty() && config.routers.is_empty() {
            let default = data_dir.join(DEFAULT_BOOTSTRAP_FILE);
            if default.exists() {
                files.push(default);
            }
        }

        let mut list = Self::new();
        for file in &files {
            for rc in Self::read_file(file)? {
                list.insert(rc);
            }
        }
        for rc in &config.routers {
            list.insert(rc.clone());
        }
        Ok(list)
    }

    /// Drops every contact that does not verify at `now`, and our own
    /// contact if present. Returns how many were dropped.
    pub fn clear_invalid(&mut self, now: Millis, netid: &str, us: &RouterId) -> usize {
        let before = self.contacts.len();
        self.contacts.retain(|id, rc| {
            if id == us {
                return false;
            }
            match rc.verify(now, netid) {
                Ok(()) => true,
                Err(e) => {
                    warn!(router = %id.short(), error = %e, "ignoring invalid bootstrap contact");
                    false
                }
            }
        });
        let dropped = before - self.contacts.len();
        if !self.contacts.is_empty() {
            info!(count = self.contacts.len(), "loaded bootstrap routers");
        }
        dropped
    }

    pub fn contains(&self, id: &RouterId) -> bool {
        self.contacts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RouterId> {
        self.contacts.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouterContact> {
        self.contacts.values()
    }
}
