//! Subcommand implementations. Each returns what it wrote or found so tests
//! can check it without capturing stdout.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use murk_router::config::{RouterConfig, DEFAULT_NETID, PROTO_VERSION, ROUTER_VERSION};
use murk_router::contact::{AddressInfo, BootstrapList, RcManager, RouterContact};
use murk_router::crypto::{KeyManager, KeyPaths, RouterId};
use murk_router::time::{human_duration, Millis};

use crate::cli::{BootstrapArgs, InitArgs, InspectArgs};

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct InitOutcome {
    pub router_id: RouterId,
    /// Set when a relay contact was signed and written.
    pub rc: Option<RouterContact>,
}

/// Loads or creates the keys under the data directory and, for a relay,
/// signs a contact advertising `public_addr`.
pub fn init_node(args: &InitArgs, now: Millis) -> Result<InitOutcome> {
    let mut config = match &args.config {
        Some(path) => RouterConfig::from_json_file(path)?,
        None => RouterConfig::default(),
    };
    config.router.data_dir = args.data_dir.clone();
    if let Some(addr) = args.public_addr {
        config.router.public_addr = Some(addr);
        config.router.is_relay = true;
    }
    if let Some(nickname) = &args.nickname {
        config.router.nickname = nickname.clone();
    }
    if let Some(netid) = &args.netid {
        config.router.netid = netid.clone();
    }

    let data_dir = &config.router.data_dir;
    tracing::info!(data_dir = %data_dir.display(), relay = config.router.is_relay, "initializing router");
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let keys = KeyManager::load_or_generate(KeyPaths::from_config(&config))
        .context("failed to load or create router keys")?;
    let router_id = keys.router_id();
    let transport_key = keys.transport().public_key();
    let mut manager = RcManager::new(keys, config.router.netid.clone());

    let rc = if config.router.is_relay {
        let Some(public_addr) = config.router.public_addr else {
            bail!("a relay needs router.public_addr or --public-addr");
        };
        let addrs = vec![AddressInfo {
            addr: public_addr,
            transport_key,
            rank: 0,
        }];
        let candidate = manager.prepare(&config.router.nickname, addrs, true);
        manager
            .sign_and_commit(candidate, now)
            .context("failed to sign router contact")?;
        let rc = manager.current().clone();
        let path = config.rc_path();
        rc.write_file(&path)
            .with_context(|| format!("failed to write router contact to {}", path.display()))?;
        tracing::info!(router_id = %router_id, path = %path.display(), "router contact written");
        Some(rc)
    } else {
        None
    };

    Ok(InitOutcome { router_id, rc })
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

/// One JSON report per contact in the file. Fails if any contact does not
/// verify, after reporting all of them.
pub fn inspect(args: &InspectArgs, now: Millis) -> Result<Vec<Value>> {
    let contacts = BootstrapList::read_file(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let reports: Vec<Value> = contacts
        .iter()
        .map(|rc| describe(rc, &args.netid, now))
        .collect();
    let invalid = reports.iter().filter(|r| r["valid"] == false).count();
    if invalid > 0 {
        for report in &reports {
            println!("{report:#}");
        }
        bail!("{invalid} of {} contacts failed verification", reports.len());
    }
    Ok(reports)
}

fn describe(rc: &RouterContact, netid: &str, now: Millis) -> Value {
    let verdict = rc.verify(now, netid);
    let updated = i64::try_from(rc.last_updated)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339());
    json!({
        "pubkey": rc.pubkey.to_hex(),
        "nickname": rc.nickname,
        "netid": rc.netid,
        "relay": rc.is_public_router(),
        "addrs": rc.addrs.iter().map(|a| a.addr.to_string()).collect::<Vec<_>>(),
        "lastUpdated": updated,
        "expiresIn": human_duration(rc.time_until_expires(now)),
        "hash": hex::encode(rc.content_hash()),
        "valid": verdict.is_ok(),
        "error": verdict.err().map(|e| e.to_string()),
    })
}

// ---------------------------------------------------------------------------
// bootstrap
// ---------------------------------------------------------------------------

/// Bundles every valid relay contact from `inputs` into one list at `out`.
/// Returns how many contacts were written.
pub fn bundle_bootstrap(args: &BootstrapArgs, now: Millis) -> Result<usize> {
    let mut list = BootstrapList::new();
    for input in &args.inputs {
        let contacts = BootstrapList::read_file(input)
            .with_context(|| format!("failed to read {}", input.display()))?;
        for rc in contacts {
            if !rc.is_public_router() {
                tracing::warn!(router = %rc.pubkey.short(), file = %input.display(), "skipping non-relay contact");
                continue;
            }
            list.insert(rc);
        }
    }
    let dropped = list.clear_invalid(now, &args.netid, &RouterId::from_bytes([0; 32]));
    if dropped > 0 {
        tracing::warn!(dropped, "skipped contacts that failed verification");
    }
    if list.is_empty() {
        bail!("no valid relay contacts to bundle");
    }
    write_bootstrap(&list, &args.out)?;
    Ok(list.len())
}

fn write_bootstrap(list: &BootstrapList, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    list.write_file(out)
        .with_context(|| format!("failed to write bootstrap list to {}", out.display()))
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

pub fn version_lines() -> Vec<String> {
    let [major, minor, patch] = ROUTER_VERSION;
    vec![
        format!("murk-node {}", env!("CARGO_PKG_VERSION")),
        format!("router    {major}.{minor}.{patch}"),
        format!("protocol  {PROTO_VERSION}"),
        format!("netid     {DEFAULT_NETID}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use murk_router::time::now_ms;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn init_args(dir: &Path, public_addr: Option<&str>) -> InitArgs {
        InitArgs {
            data_dir: dir.to_path_buf(),
            config: None,
            public_addr: public_addr.map(|a| a.parse().unwrap()),
            nickname: Some("alpha".into()),
            netid: None,
        }
    }

    fn relay_in(dir: &Path, now: Millis) -> (PathBuf, RouterContact) {
        let outcome = init_node(&init_args(dir, Some("203.0.113.7:1090")), now).unwrap();
        (dir.join("self.signed"), outcome.rc.unwrap())
    }

    #[test]
    fn init_relay_writes_verifiable_contact() {
        let dir = TempDir::new().unwrap();
        let now = now_ms();
        let (path, rc) = relay_in(dir.path(), now);

        let saved = RouterContact::read_file(&path).unwrap();
        assert_eq!(saved, rc);
        assert!(saved.verify(now, DEFAULT_NETID).is_ok());
        assert_eq!(saved.nickname, "alpha");
        assert!(saved.is_public_router());
    }

    #[test]
    fn init_reuses_existing_keys() {
        let dir = TempDir::new().unwrap();
        let first = init_node(&init_args(dir.path(), None), now_ms()).unwrap();
        let second = init_node(&init_args(dir.path(), None), now_ms()).unwrap();
        assert_eq!(first.router_id, second.router_id);
        assert!(first.rc.is_none());
        assert!(!dir.path().join("self.signed").exists());
    }

    #[test]
    fn init_relay_from_config_needs_address() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("router.json");
        std::fs::write(&config_path, r#"{ "router": { "is_relay": true } }"#).unwrap();
        let mut args = init_args(dir.path(), None);
        args.config = Some(config_path);
        assert!(init_node(&args, now_ms()).is_err());
    }

    #[test]
    fn inspect_reports_each_contact() {
        let dir = TempDir::new().unwrap();
        let now = now_ms();
        let (path, rc) = relay_in(dir.path(), now);
        let reports = inspect(
            &InspectArgs {
                file: path,
                netid: DEFAULT_NETID.into(),
            },
            now,
        )
        .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["pubkey"], rc.pubkey.to_hex());
        assert_eq!(reports[0]["valid"], true);
        assert_eq!(reports[0]["addrs"][0], "203.0.113.7:1090");
    }

    #[test]
    fn inspect_fails_on_wrong_network() {
        let dir = TempDir::new().unwrap();
        let now = now_ms();
        let (path, _) = relay_in(dir.path(), now);
        let result = inspect(
            &InspectArgs {
                file: path,
                netid: "elsewhere".into(),
            },
            now,
        );
        assert!(result.is_err());
    }

    #[test]
    fn bundle_collects_relays_into_one_list() {
        let now = now_ms();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let (path_a, rc_a) = relay_in(a.path(), now);
        let (path_b, rc_b) = relay_in(b.path(), now);
        let out = a.path().join("lists").join("bootstrap.signed");

        let written = bundle_bootstrap(
            &BootstrapArgs {
                inputs: vec![path_a.clone(), path_b, path_a],
                out: out.clone(),
                netid: DEFAULT_NETID.into(),
            },
            now,
        )
        .unwrap();
        assert_eq!(written, 2);

        let mut ids: Vec<RouterId> = BootstrapList::read_file(&out)
            .unwrap()
            .into_iter()
            .map(|rc| rc.pubkey)
            .collect();
        ids.sort();
        let mut expected = vec![rc_a.pubkey, rc_b.pubkey];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn bundle_with_nothing_valid_fails() {
        let now = now_ms();
        let dir = TempDir::new().unwrap();
        let (path, _) = relay_in(dir.path(), now);
        let result = bundle_bootstrap(
            &BootstrapArgs {
                inputs: vec![path],
                out: dir.path().join("out.signed"),
                netid: "elsewhere".into(),
            },
            now,
        );
        assert!(result.is_err());
        assert!(!dir.path().join("out.signed").exists());
    }

    #[test]
    fn version_mentions_router_release() {
        let lines = version_lines();
        assert!(lines[0].starts_with("murk-node "));
        assert!(lines.iter().any(|l| l.starts_with("protocol")));
    }
}
