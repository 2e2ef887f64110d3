//! # RC Manager
//!
//! Owns our own router contact and the keys behind it. Every change to the
//! published RC goes through [`RcManager::sign_and_commit`]: the candidate is
//! checked, signed, verified again, and only then replaces the committed RC.
//! A failure anywhere leaves the previous RC in place.
//!
//! ## Rotation
//!
//! [`RcManager::rotate_encryption_key`] builds and signs the next RC with a
//! fresh onion key before anything is written. The new private key is then
//! persisted, and only after that succeeds are key and RC swapped in
//! together. There is no state in which the published onion key and the
//! key on disk disagree.

use tracing::{debug, info};

use super::{AddressInfo, RouterContact, RouterVersion, SignError};
use crate::crypto::{EncryptionKey, IdentityKey, KeyError, KeyManager, RouterId};
use crate::time::Millis;

/// Our committed RC plus the key material that signs it.
#[derive(Debug)]
pub struct RcManager {
    keys: KeyManager,
    current: RouterContact,
    netid: String,
}

impl RcManager {
    /// Starts from an unsigned RC carrying our current public keys.
    pub fn new(keys: KeyManager, netid: impl Into<String>) -> Self {
        let netid = netid.into();
        let current = RouterContact::new(
            keys.router_id(),
            keys.encryption().public_key(),
            netid.clone(),
        );
        Self {
            keys,
            current,
            netid,
        }
    }

    /// Adopts `previous.last_updated` as the floor for future signatures
    /// when it is our own RC from an earlier run.
    pub fn restore_timestamp(&mut self, previous: &RouterContact) {
        if previous.pubkey == self.current.pubkey && previous.last_updated > self.current.last_updated
        {
            debug!(last_updated = previous.last_updated, "restored RC timestamp floor");
            self.current.last_updated = previous.last_updated;
        }
    }

    pub fn current(&self) -> &RouterContact {
        &self.current
    }

    /// A copy of the committed RC to edit and pass back to
    /// [`sign_and_commit`](Self::sign_and_commit).
    pub fn candidate(&self) -> RouterContact {
        self.current.clone()
    }

    pub fn router_id(&self) -> RouterId {
        self.keys.router_id()
    }

    pub fn identity(&self) -> &IdentityKey {
        self.keys.identity()
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn netid(&self) -> &str {
        &self.netid
    }

    pub fn is_signed(&self) -> bool {
        !self.current.signature.is_empty()
    }

    /// Fills in our addresses and relay version on the candidate.
    pub fn prepare(
        &self,
        nickname: &str,
        addrs: Vec<AddressInfo>,
        is_relay: bool,
    ) -> RouterContact {
        let mut rc = self.candidate();
        rc.nickname = nickname.to_string();
        rc.addrs = addrs;
        rc.router_version = is_relay.then(RouterVersion::current);
        rc
    }

    /// Signs `candidate` at `now` and commits it if it verifies.
    ///
    /// `last_updated` never moves backwards: if the clock is behind the
    /// committed RC, the committed timestamp is reused.
    pub fn sign_and_commit(
        &mut self,
        mut candidate: RouterContact,
        now: Millis,
    ) -> Result<(), SignError> {
        self.stamp_and_sign(&mut candidate, now)?;
        self.current = candidate;
        Ok(())
    }

    /// Re-signs the committed RC unchanged apart from its timestamp.
    pub fn resign(&mut self, now: Millis) -> Result<(), SignError> {
        let candidate = self.candidate();
        self.sign_and_commit(candidate, now)
    }

    fn stamp_and_sign(&self, candidate: &mut RouterContact, now: Millis) -> Result<(), SignError> {
        if candidate.pubkey != self.keys.router_id() {
            return Err(SignError::KeyMismatch);
        }
        candidate.check_well_formed(&self.netid)?;
        candidate.last_updated = now.max(self.current.last_updated);
        candidate.sign(self.keys.identity())?;
        candidate.verify(now.max(candidate.last_updated), &self.netid)
    }

    /// Generates a new onion key, persists it, and commits a re-signed RC.
    /// On any failure the previous key and RC stay active.
    pub fn rotate_encryption_key(&mut self, now: Millis) -> Result<(), KeyError> {
        let next_key = EncryptionKey::generate();
        let mut candidate = self.candidate();
        candidate.enckey = next_key.public_key();
        self.stamp_and_sign(&mut candidate, now)?;

        self.keys.persist_encryption(&next_key)?;

        info!(enckey = %next_key.public_key().short(), "rotated encryption key");
        self.keys.set_encryption(next_key);
        self.current = candidate;
        Ok(())
    }

    /// Replaces identity and onion keys with ephemeral ones and signs a new
    /// RC for them. Used by clients at start.
    pub fn regenerate_ephemeral(&mut self, now: Millis) -> Result<(), SignError> {
        self.keys.regenerate_ephemeral();
        let mut candidate = self.candidate();
        candidate.pubkey = self.keys.router_id();
        candidate.enckey = self.keys.encryption().public_key();
        self.sign_and_commit(candidate, now)
    }

    /// True when the committed RC is unsigned or expires within
    /// `window + jitter` of `now`.
    pub fn is_expiring_within(&self, now: Millis, window: Millis, jitter: Millis) -> bool {
        !self.is_signed() || self.current.expires_soon(now, window.saturating_add(jitter))
    }

    pub fn age(&self, now: Millis) -> Millis {
        self.current.age(now)
    }
}
