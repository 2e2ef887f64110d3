//! # Router Profiling
//!
//! Clients remember which routers failed them. A router that keeps timing
//! out on connect is skipped when picking random peers; one that keeps
//! failing path builds is skipped as a hop. Relays turn profiling off.
//!
//! Profiles decay: every [`PROFILE_DECAY_INTERVAL`] the counters are halved,
//! so a router that had a bad hour is forgiven eventually. They are saved as
//! JSON to `profiles.dat` on the disk queue.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ms, PROFILE_SAVE_INTERVAL};
use crate::contact::ContactError;
use crate::crypto::RouterId;
use crate::time::Millis;

/// Connect timeouts tolerated before the success ratio is consulted.
const CONNECT_CHANCES: u64 = 4;

/// Path failures tolerated before the success ratio is consulted.
const PATH_CHANCES: u64 = 8;

const PROFILE_DECAY_INTERVAL: Millis = 10 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterProfile {
    pub connect_timeouts: u64,
    pub connect_successes: u64,
    pub path_successes: u64,
    pub path_failures: u64,
    pub last_updated: Millis,
    pub last_decay: Millis,
}

impl RouterProfile {
    pub fn is_good_for_connect(&self) -> bool {
        self.connect_timeouts <= CONNECT_CHANCES || self.connect_successes >= self.connect_timeouts
    }

    pub fn is_good_for_path(&self) -> bool {
        self.path_failures <= PATH_CHANCES || self.path_successes * 2 >= self.path_failures
    }

    fn decay(&mut self, now: Millis) {
        self.connect_timeouts /= 2;
        self.connect_successes /= 2;
        self.path_successes /= 2;
        self.path_failures /= 2;
        self.last_decay = now;
    }
}

#[derive(Debug)]
pub struct RouterProfiling {
    profiles: RwLock<BTreeMap<RouterId, RouterProfile>>,
    enabled: AtomicBool,
    dirty: AtomicBool,
    last_save: AtomicU64,
}

impl Default for RouterProfiling {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterProfiling {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(BTreeMap::new()),
            enabled: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            last_save: AtomicU64::new(0),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn modify(&self, id: &RouterId, now: Millis, f: impl FnOnce(&mut RouterProfile)) {
        if !self.is_enabled() {
            return;
        }
        let mut profiles = self.profiles.write();
        let profile = profiles.entry(*id).or_insert_with(|| RouterProfile {
            last_decay: now,
            ..RouterProfile::default()
        });
        f(profile);
        profile.last_updated = now;
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn mark_connect_timeout(&self, id: &RouterId, now: Millis) {
        self.modify(id, now, |p| p.connect_timeouts += 1);
    }

    pub fn mark_connect_success(&self, id: &RouterId, now: Millis) {
        self.modify(id, now, |p| p.connect_successes += 1);
    }

    pub fn mark_path_success(&self, id: &RouterId, now: Millis) {
        self.modify(id, now, |p| p.path_successes += 1);
    }

    pub fn mark_path_failure(&self, id: &RouterId, now: Millis) {
        self.modify(id, now, |p| p.path_failures += 1);
    }

    pub fn is_bad_for_connect(&self, id: &RouterId) -> bool {
        self.is_enabled()
            && self
                .profiles
                .read()
                .get(id)
                .is_some_and(|p| !p.is_good_for_connect())
    }

    pub fn is_bad_for_path(&self, id: &RouterId) -> bool {
        self.is_enabled()
            && self
                .profiles
                .read()
                .get(id)
                .is_some_and(|p| !p.is_good_for_path())
    }

    pub fn get(&self, id: &RouterId) -> Option<RouterProfile> {
        self.profiles.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }

    /// Halves counters on profiles whose decay interval has passed.
    pub fn tick(&self, now: Millis) {
        if !self.is_enabled() {
            return;
        }
        let mut profiles = self.profiles.write();
        for profile in profiles.values_mut() {
            if now.saturating_sub(profile.last_decay) >= PROFILE_DECAY_INTERVAL {
                profile.decay(now);
            }
        }
    }

    pub fn should_save(&self, now: Millis) -> bool {
        self.is_enabled()
            && self.dirty.load(Ordering::Relaxed)
            && now.saturating_sub(self.last_save.load(Ordering::Relaxed))
                >= ms(PROFILE_SAVE_INTERVAL)
    }

    /// Records that a save was queued at `now`.
    pub fn mark_save_scheduled(&self, now: Millis) {
        self.last_save.store(now, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Relaxed);
    }

    pub fn save(&self, path: &Path) -> Result<(), ContactError> {
        let json = {
            let profiles = self.profiles.read();
            serde_json::to_vec_pretty(&*profiles).map_err(ContactError::Encode)?
        };
        crate::contact::router_contact::write_atomic(path, &json)?;
        debug!(path = %path.display(), "saved router profiles");
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<usize, ContactError> {
        let raw = fs::read(path).map_err(|source| ContactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded: BTreeMap<RouterId, RouterProfile> =
            serde_json::from_slice(&raw).map_err(|source| ContactError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        let count = loaded.len();
        *self.profiles.write() = loaded;
        Ok(count)
    }
}
