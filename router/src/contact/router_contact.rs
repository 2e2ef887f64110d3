//! # Router Contact (RC)
//!
//! The signed record a router publishes about itself: identity key, onion
//! key, reachable addresses, nickname, network id and version, stamped with
//! the time it was signed.
//!
//! ## Signing payload
//!
//! The signature covers the `bincode` encoding of every field except the
//! signature itself, in declaration order. bincode is deterministic for these
//! types, so any two implementations agree on the bytes.
//!
//! ## Freshness
//!
//! An RC is valid for [`RC_LIFETIME`] after `last_updated`. A relay re-signs
//! well before that; see [`RouterContact::expires_soon`].

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ContactError, SignError};
use crate::config::{
    ms, MAX_NICKNAME_LEN, MAX_RC_ADDRS, PROTO_VERSION, RC_FORMAT_VERSION, RC_LIFETIME,
    RC_MAX_FUTURE_SKEW, ROUTER_VERSION,
};
use crate::crypto::{EncryptionPublicKey, IdentityKey, RouterId, Signature};
use crate::time::Millis;

/// One reachable address of a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub addr: SocketAddr,
    /// Link transport key peers use to open a session on this address.
    pub transport_key: EncryptionPublicKey,
    /// Lower is preferred.
    pub rank: u16,
}

/// Software and protocol version, present only on relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterVersion {
    pub version: [u16; 3],
    pub proto: u8,
}

impl RouterVersion {
    pub const fn current() -> Self {
        Self {
            version: ROUTER_VERSION,
            proto: PROTO_VERSION,
        }
    }
}

/// A signed router contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterContact {
    pub pubkey: RouterId,
    pub enckey: EncryptionPublicKey,
    #[serde(default)]
    pub addrs: Vec<AddressInfo>,
    #[serde(default)]
    pub nickname: String,
    pub netid: String,
    pub version: u64,
    #[serde(default)]
    pub router_version: Option<RouterVersion>,
    pub last_updated: Millis,
    #[serde(default)]
    pub signature: Signature,
}

#[derive(Serialize)]
struct SigningView<'a> {
    pubkey: &'a RouterId,
    enckey: &'a EncryptionPublicKey,
    addrs: &'a [AddressInfo],
    nickname: &'a str,
    netid: &'a str,
    version: u64,
    router_version: &'a Option<RouterVersion>,
    last_updated: Millis,
}

impl RouterContact {
    /// An unsigned contact for `pubkey` on network `netid`.
    pub fn new(pubkey: RouterId, enckey: EncryptionPublicKey, netid: impl Into<String>) -> Self {
        Self {
            pubkey,
            enckey,
            addrs: Vec::new(),
            nickname: String::new(),
            netid: netid.into(),
            version: RC_FORMAT_VERSION,
            router_version: None,
            last_updated: 0,
            signature: Signature::default(),
        }
    }

    /// The bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, SignError> {
        let view = SigningView {
            pubkey: &self.pubkey,
            enckey: &self.enckey,
            addrs: &self.addrs,
            nickname: &self.nickname,
            netid: &self.netid,
            version: self.version,
            router_version: &self.router_version,
            last_updated: self.last_updated,
        };
        bincode::serialize(&view).map_err(|e| SignError::Encode(e.to_string()))
    }

    /// Structural checks that do not involve the signature or the clock.
    pub fn check_well_formed(&self, netid: &str) -> Result<(), SignError> {
        if self.netid != netid {
            return Err(SignError::WrongNetId {
                expected: netid.to_string(),
                got: self.netid.clone(),
            });
        }
        if self.nickname.len() > MAX_NICKNAME_LEN {
            return Err(SignError::Malformed("nickname too long"));
        }
        if self.addrs.len() > MAX_RC_ADDRS {
            return Err(SignError::Malformed("too many addresses"));
        }
        if self.router_version.is_some() && self.addrs.is_empty() {
            return Err(SignError::Malformed("relay contact without addresses"));
        }
        if self.pubkey.is_zero() || self.enckey.is_zero() {
            return Err(SignError::Malformed("zero key"));
        }
        Ok(())
    }

    /// Signs with `key`, which must be the key named in `pubkey`.
    pub fn sign(&mut self, key: &IdentityKey) -> Result<(), SignError> {
        if key.router_id() != self.pubkey {
            return Err(SignError::KeyMismatch);
        }
        let payload = self.signing_bytes()?;
        self.signature = key.sign(&payload);
        Ok(())
    }

    /// Checks the signature only.
    pub fn verify_signature(&self) -> Result<(), SignError> {
        let payload = self.signing_bytes()?;
        if self.pubkey.verify(&payload, &self.signature) {
            Ok(())
        } else {
            Err(SignError::BadSignature)
        }
    }

    /// Full validity check at time `now`: shape, network, signature and
    /// freshness.
    pub fn verify(&self, now: Millis, netid: &str) -> Result<(), SignError> {
        self.check_well_formed(netid)?;
        self.verify_signature()?;
        if self.is_expired(now) {
            return Err(SignError::Expired);
        }
        if self.last_updated > now.saturating_add(ms(RC_MAX_FUTURE_SKEW)) {
            return Err(SignError::FromFuture);
        }
        Ok(())
    }

    /// A relay that can be dialed: advertises a version and an address.
    pub fn is_public_router(&self) -> bool {
        self.router_version.is_some() && !self.addrs.is_empty()
    }

    pub fn expires_at(&self) -> Millis {
        self.last_updated.saturating_add(ms(RC_LIFETIME))
    }

    pub fn is_expired(&self, now: Millis) -> bool {
        now >= self.expires_at()
    }

    /// True when the RC expires within `window` of `now`.
    pub fn expires_soon(&self, now: Millis, window: Millis) -> bool {
        now.saturating_add(window) >= self.expires_at()
    }

    pub fn age(&self, now: Millis) -> Millis {
        now.saturating_sub(self.last_updated)
    }

    pub fn time_until_expires(&self, now: Millis) -> Millis {
        self.expires_at().saturating_sub(now)
    }

    pub fn is_newer_than(&self, other: &RouterContact) -> bool {
        self.last_updated > other.last_updated
    }

    /// BLAKE3 digest over payload and signature; identifies one signed
    /// version of an RC in logs and status output.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        if let Ok(payload) = self.signing_bytes() {
            hasher.update(&payload);
        }
        hasher.update(self.signature.as_bytes());
        *hasher.finalize().as_bytes()
    }

    pub fn read_file(path: &Path) -> Result<Self, ContactError> {
        let raw = fs::read(path).map_err(|source| ContactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ContactError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write_file(&self, path: &Path) -> Result<(), ContactError> {
        let json = serde_json::to_vec_pretty(self).map_err(ContactError::Encode)?;
        write_atomic(path, &json)
    }
}

/// Writes `bytes` through a temporary sibling and renames it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ContactError> {
    let io_err = |source| ContactError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}
