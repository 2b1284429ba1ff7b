//! TOML configuration for both binaries, plus a `notify`-driven
//! hot-reload watcher over the server's peer table. Replaces the
//! original's YAML loader and polling reload timer (`server/config_watcher.rs`
//! polled on a fixed interval; this watches the filesystem directly).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::conf::{PeerConf, PeerTable};
use crate::crypto::identity::{PeerId, ID_SIZE};
use crate::crypto::verifier::Verifier;

#[derive(Debug, Clone, Deserialize)]
pub struct TunFile {
    pub name: String,
    pub address: String,
    pub netmask: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerFile {
    /// Base64 (unpadded), 16-byte peer identity.
    pub id: String,
    #[serde(default = "default_iface")]
    pub iface: String,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub noise: bool,
    #[serde(default)]
    pub cpr: u32,
    #[serde(default)]
    pub encless: bool,
    #[serde(default)]
    pub time_sync: i64,
    pub up: Option<String>,
    pub down: Option<String>,
    /// `$argon2d$m=..,t=..,p=..$<id>[$<pub>]` -- long form (with the
    /// public key) on the server, short form on the client.
    pub verifier: String,
}

fn default_iface() -> String {
    "tap0".to_string()
}
fn default_mtu() -> usize {
    1500
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerFile {
    pub listen: String,
    pub protocol: Protocol,
    pub stats_addr: Option<String>,
    pub tun: TunFile,
    pub peers: Vec<PeerFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientFile {
    pub remote: String,
    pub protocol: Protocol,
    pub stats_addr: Option<String>,
    pub tun: TunFile,
    pub peer: PeerFile,
    /// Passphrase used to re-derive the Ed25519 private key at startup;
    /// never persisted in the in-memory `PeerConf`.
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

fn decode_peer(pf: &PeerFile) -> crate::Result<PeerConf> {
    let id_bytes = STANDARD_NO_PAD
        .decode(&pf.id)
        .map_err(|e| format!("peer id base64: {e}"))?;
    if id_bytes.len() != ID_SIZE {
        return Err(format!("peer id must be {ID_SIZE} bytes, got {}", id_bytes.len()).into());
    }
    let mut id = [0u8; ID_SIZE];
    id.copy_from_slice(&id_bytes);
    let verifier =
        Verifier::from_string(&pf.verifier).map_err(|e| format!("verifier: {e}"))?;

    Ok(PeerConf {
        id: PeerId(id),
        iface: pf.iface.clone(),
        mtu: pf.mtu,
        timeout: Duration::from_secs(pf.timeout_secs),
        noise: pf.noise,
        cpr: pf.cpr,
        encless: pf.encless,
        time_sync: pf.time_sync,
        up: pf.up.clone(),
        down: pf.down.clone(),
        verifier,
        dsa_priv: None,
    })
}

/// Parses a server TOML file into its structural settings and the table
/// of configured peers (each with `verifier.public` present -- the
/// server only ever holds the long form).
pub fn load_server(path: &Path) -> crate::Result<(ServerFile, PeerTable)> {
    let text = std::fs::read_to_string(path)?;
    let file: ServerFile = toml::from_str(&text)?;
    let mut peers = HashMap::new();
    for pf in &file.peers {
        let conf = decode_peer(pf)?;
        if conf.verifier.public.is_none() {
            return Err(format!("peer {} missing public key in verifier", conf.id).into());
        }
        peers.insert(conf.id, conf);
    }
    Ok((file, peers))
}

/// Parses a client TOML file, deriving the client's own signing key from
/// `password` via the peer's verifier parameters.
pub fn load_client(path: &Path) -> crate::Result<(ClientFile, PeerConf)> {
    let text = std::fs::read_to_string(path)?;
    let file: ClientFile = toml::from_str(&text)?;
    let mut conf = decode_peer(&file.peer)?;
    let priv_key = conf
        .verifier
        .password_apply(&file.password)
        .map_err(|e| format!("deriving key from password: {e}"))?;
    conf.dsa_priv = Some(priv_key);
    Ok((file, conf))
}

/// Re-parses `path` on every filesystem write event and forwards the
/// updated peer table, diffed against the previous load, to `sink`.
/// Runs until the returned watcher (or its receiver task) is dropped.
pub fn watch_server_config(
    path: PathBuf,
    sink: mpsc::Sender<PeerTable>,
) -> crate::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                let _ = tx.send(());
            }
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match load_server(&path) {
                Ok((_, peers)) => {
                    tracing::info!(count = peers.len(), "reloaded peer configuration");
                    if sink.send(peers).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to reload configuration"),
            }
        }
    });

    Ok(watcher)
}
