//! # Key Files
//!
//! Loads or creates the three secret keys a router keeps on disk:
//!
//! | File                 | Key                    |
//! |----------------------|------------------------|
//! | `identity.private`   | Ed25519 identity seed  |
//! | `encryption.private` | X25519 onion key       |
//! | `transport.private`  | X25519 link key        |
//!
//! Each file holds one hex-encoded 32-byte secret. Writes go to a temporary
//! sibling first and are renamed into place, so a crash mid-write never
//! leaves a truncated key behind. On Unix the files are created `0600`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::keys::{EncryptionKey, IdentityKey, KeyError, RouterId};
use crate::config::{
    RouterConfig, ENCRYPTION_KEY_FILE, IDENTITY_KEY_FILE, OUR_RC_FILE, TRANSPORT_KEY_FILE,
};

/// Where each key (and our signed RC) lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub identity: PathBuf,
    pub encryption: PathBuf,
    pub transport: PathBuf,
    pub rc: PathBuf,
}

impl KeyPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            identity: dir.join(IDENTITY_KEY_FILE),
            encryption: dir.join(ENCRYPTION_KEY_FILE),
            transport: dir.join(TRANSPORT_KEY_FILE),
            rc: dir.join(OUR_RC_FILE),
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::in_dir(&config.router.data_dir)
    }
}

/// Owns the router's secret keys.
///
/// Only the [`RcManager`](crate::contact::RcManager) mutates a `KeyManager`
/// after startup, and only through its rotation methods.
#[derive(Debug)]
pub struct KeyManager {
    paths: KeyPaths,
    identity: IdentityKey,
    encryption: EncryptionKey,
    transport: EncryptionKey,
}

impl KeyManager {
    /// Loads every key file under `paths`, generating and persisting any
    /// that are missing.
    pub fn load_or_generate(paths: KeyPaths) -> Result<Self, KeyError> {
        let identity = load_or_create(&paths.identity, IdentityKey::from_hex, || {
            let key = IdentityKey::generate();
            let hex = key.secret_hex();
            (key, hex)
        })?;
        Self::with_identity(paths, identity)
    }

    /// Uses an identity obtained elsewhere (service-node RPC) and loads the
    /// remaining keys from disk. The identity file is left untouched.
    pub fn with_identity(paths: KeyPaths, identity: IdentityKey) -> Result<Self, KeyError> {
        let encryption = load_or_create(&paths.encryption, EncryptionKey::from_hex, || {
            let key = EncryptionKey::generate();
            let hex = key.secret_hex();
            (key, hex)
        })?;
        let transport = load_or_create(&paths.transport, EncryptionKey::from_hex, || {
            let key = EncryptionKey::generate();
            let hex = key.secret_hex();
            (key, hex)
        })?;
        info!(router = %identity.router_id().short(), "router keys ready");
        Ok(Self {
            paths,
            identity,
            encryption,
            transport,
        })
    }

    pub fn paths(&self) -> &KeyPaths {
        &self.paths
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn encryption(&self) -> &EncryptionKey {
        &self.encryption
    }

    pub fn transport(&self) -> &EncryptionKey {
        &self.transport
    }

    pub fn router_id(&self) -> RouterId {
        self.identity.router_id()
    }

    /// Writes `key` to the encryption key file without activating it.
    pub fn persist_encryption(&self, key: &EncryptionKey) -> Result<(), KeyError> {
        write_key_file(&self.paths.encryption, &key.secret_hex())
    }

    /// Activates an encryption key. Callers persist it first.
    pub(crate) fn set_encryption(&mut self, key: EncryptionKey) {
        self.encryption = key;
    }

    /// Replaces identity and encryption keys with fresh, unpersisted ones.
    /// Clients do this at every start so their RC does not link sessions
    /// across restarts.
    pub(crate) fn regenerate_ephemeral(&mut self) {
        self.identity = IdentityKey::generate();
        self.encryption = EncryptionKey::generate();
        debug!(router = %self.identity.router_id().short(), "generated ephemeral keys");
    }
}

fn load_or_create<K>(
    path: &Path,
    parse: impl Fn(&str) -> Result<K, KeyError>,
    create: impl FnOnce() -> (K, String),
) -> Result<K, KeyError> {
    match fs::read_to_string(path) {
        Ok(contents) => parse(&contents).map_err(|_| KeyError::Malformed(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let (key, hex) = create();
            write_key_file(path, &hex)?;
            info!(path = %path.display(), "generated new key file");
            Ok(key)
        }
        Err(source) => Err(KeyError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Atomically writes a hex secret to `path` (temp file + rename).
pub fn write_key_file(path: &Path, hex: &str) -> Result<(), KeyError> {
    let io_err = |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(io_err)?;
        file.write_all(hex.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)
}
