//! Client role entry point: loads configuration, derives the client's
//! signing key from its passphrase, and drives the point-to-point
//! session against a single remote address. Grounded on the same
//! `server/server.rs`/`server/runner.rs` shape the server role uses,
//! mirrored onto a single-peer client instead of an address-keyed map.

pub mod tcp;
pub mod udp;

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::{self, Protocol};

/// Runs the client until the session is torn down by a transport error
/// or the process is asked to exit. Reconnects/rehandshakes internally;
/// only a fatal transport error or misconfiguration returns `Err`. Ctrl-C
/// (SIGINT) stops the reconnect loop and returns `Ok(())` rather than
/// retrying after the socket and TAP device have already been dropped.
pub async fn run(config_path: &Path) -> crate::Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let (file, conf) = config::load_client(config_path)?;
    tracing::info!(remote = %file.remote, peer = %conf.id, protocol = ?file.protocol, "starting client");

    if let Some(addr) = file.stats_addr.clone() {
        tracing::warn!(%addr, "stats endpoint is only wired up for the server role currently");
    }

    let session: std::pin::Pin<Box<dyn std::future::Future<Output = crate::Result<()>>>> =
        match file.protocol {
            Protocol::Udp => Box::pin(udp::run(file, conf)),
            Protocol::Tcp => Box::pin(tcp::run(file, conf)),
        };

    tokio::select! {
        res = session => res,
        _ = shutdown.cancelled() => {
            tracing::info!("client shutting down");
            Ok(())
        }
    }
}
