//! # Decaying Set
//!
//! A set whose entries expire a fixed window after insertion. The gossip
//! replay table and the path-build limiter are both one of these: "have we
//! done X for key K recently?"
//!
//! Expiry is lazy. Entries stay until [`DecayingHashSet::decay`] runs, which
//! the router does once per tick, but [`DecayingHashSet::contains`] already
//! ignores entries past their window.

use std::collections::HashMap;
use std::hash::Hash;

use crate::time::Millis;

#[derive(Debug, Clone)]
pub struct DecayingHashSet<K> {
    entries: HashMap<K, Millis>,
    window: Millis,
}

impl<K: Hash + Eq + Clone> DecayingHashSet<K> {
    pub fn new(window: Millis) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Millis {
        self.window
    }

    /// Inserts `key` at `now`. Returns `false` (and leaves the original
    /// timestamp) if it is already present and unexpired.
    pub fn insert(&mut self, key: K, now: Millis) -> bool {
        if self.contains(&key, now) {
            return false;
        }
        self.entries.insert(key, now);
        true
    }

    pub fn contains(&self, key: &K, now: Millis) -> bool {
        self.entries
            .get(key)
            .is_some_and(|inserted| now < inserted.saturating_add(self.window))
    }

    /// When `key` was inserted, if it still is.
    pub fn inserted_at(&self, key: &K) -> Option<Millis> {
        self.entries.get(key).copied()
    }

    /// Drops every entry whose window has passed at `now`.
    pub fn decay(&mut self, now: Millis) -> usize {
        let window = self.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, inserted| now < inserted.saturating_add(window));
        before - self.entries.len()
    }

    pub fn forget(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
