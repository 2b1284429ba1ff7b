//! Server role entry point: loads configuration, brings up the UDP or
//! TCP transport, and wires in hot config reload and the stats
//! endpoint. Grounded on `server/server.rs`/`server/runner.rs`'s overall
//! shape, replumbed onto the new handshake/peer engine.

pub mod supervisor;
pub mod tcp;

pub use supervisor::Supervisor;

use std::path::Path;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Protocol};

/// Runs the server until it receives a shutdown signal. `config_path` is
/// watched for changes for the lifetime of the process. Ctrl-C (SIGINT)
/// cancels `shutdown`, which unwinds every spawned task and the accept
/// or recv loop in turn rather than killing the process mid-packet.
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

    let (file, peers) = config::load_server(config_path)?;
    tracing::info!(listen = %file.listen, peers = peers.len(), protocol = ?file.protocol, "starting server");

    let (reload_tx, mut reload_rx) = mpsc::channel(4);
    let _watcher = config::watch_server_config(config_path.to_path_buf(), reload_tx)?;

    match file.protocol {
        Protocol::Udp => {
            let socket = Arc::new(UdpSocket::bind(&file.listen).await?);
            let supervisor = Supervisor::new(peers, file.tun.clone(), socket.clone());

            if let Some(addr) = file.stats_addr.clone() {
                let supervisor = supervisor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        res = crate::stats::serve(&addr, supervisor) => {
                            if let Err(e) = res {
                                tracing::error!(error = %e, "stats server exited");
                            }
                        }
                        _ = shutdown.cancelled() => {}
                    }
                });
            }

            {
                let supervisor = supervisor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                                supervisor.reap_stale_handshakes().await;
                            }
                            _ = shutdown.cancelled() => return,
                        }
                    }
                });
            }

            {
                let supervisor = supervisor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            Some(peers) = reload_rx.recv() => supervisor.reload(peers).await,
                            _ = shutdown.cancelled() => return,
                        }
                    }
                });
            }

            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        let (n, addr) = recv?;
                        let supervisor = supervisor.clone();
                        let data = buf[..n].to_vec();
                        tokio::spawn(async move {
                            supervisor.handle_udp(&data, addr).await;
                        });
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("server shutting down");
                        return Ok(());
                    }
                }
            }
        }
        Protocol::Tcp => {
            let server = tcp::TcpServer::new(peers, file.tun.clone());

            if let Some(addr) = file.stats_addr.clone() {
                tracing::warn!(%addr, "stats endpoint is only wired up for the udp transport currently");
            }

            {
                let server = server.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            Some(peers) = reload_rx.recv() => server.reload(peers).await,
                            _ = shutdown.cancelled() => return,
                        }
                    }
                });
            }

            tokio::select! {
                res = server.listen(&file.listen) => res,
                _ = shutdown.cancelled() => {
                    tracing::info!("server shutting down");
                    Ok(())
                }
            }
        }
    }
}
