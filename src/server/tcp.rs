//! TCP transport for the server role: one handshake and one promoted
//! session per accepted connection, framed by scanning the stream for
//! the next expected encrypted nonce (see `transport::TcpFrameScanner`).
//! A TCP connection already serializes its own traffic, so unlike the
//! UDP supervisor this needs no shared address-keyed session maps.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::conf::PeerTable;
use crate::config::TunFile;
use crate::crypto::identity::CipherCache;
use crate::device::{TunConfig, TunDevice};
use crate::handshake::Handshake;
use crate::peer::PktOutcome;
use crate::scripts;
use crate::transport::TcpFrameScanner;

pub struct TcpServer {
    known_peers: RwLock<PeerTable>,
    cache: CipherCache,
    tun_file: TunFile,
}

impl TcpServer {
    pub fn new(known_peers: PeerTable, tun_file: TunFile) -> Arc<Self> {
        let cache = CipherCache::new();
        cache.update(&known_peers);
        Arc::new(Self {
            known_peers: RwLock::new(known_peers),
            cache,
            tun_file,
        })
    }

    pub async fn reload(&self, peers: PeerTable) {
        self.cache.update(&peers);
        *self.known_peers.write().await = peers;
    }

    /// Accepts connections on `addr` with exponential backoff on
    /// transient errors, spawning one task per connection. Mirrors
    /// `network/tcp_listener.rs`'s retry policy.
    pub async fn listen(self: Arc<Self>, addr: &str) -> crate::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "tcp server listening");
        let mut backoff = 1u64;
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    backoff = 1;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer_addr).await {
                            tracing::debug!(%peer_addr, error = %e, "tcp connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff, "tcp accept failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(64);
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> crate::Result<()> {
        let mut buf = [0u8; 4096];

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let Some(pid) = self.cache.find(&buf[..n]) else {
            tracing::debug!(%addr, "unidentified tcp handshake attempt, closing");
            return Ok(());
        };
        let Some(conf) = self.known_peers.read().await.get(&pid).cloned() else {
            return Ok(());
        };
        let mut rng = OsRng;
        let (mut hs, m2) = Handshake::server_recv_m1(&conf, &buf[..n], &mut rng)?;
        stream.write_all(&m2).await?;

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let (m4, peer) = hs.server_recv_m3(&buf[..n])?;
        stream.write_all(&m4).await?;
        tracing::info!(%addr, peer = %peer.id, "tcp session promoted");

        let tun = TunDevice::create(TunConfig {
            name: conf.iface.clone(),
            address: self.tun_file.address.clone(),
            netmask: self.tun_file.netmask.clone(),
            mtu: peer.mtu() as u16,
        })
        .await?;
        let (tun_tx, mut tun_rx) = tun.split();
        let peer = Arc::new(peer);

        if let Some(up) = &conf.up {
            let up = up.clone();
            let iface = conf.iface.clone();
            let remote = addr.to_string();
            tokio::spawn(async move { scripts::run_hook(Some(&up), &iface, &remote).await });
        }

        let (mut read_half, mut write_half) = stream.into_split();
        let egress_peer = peer.clone();
        let egress = tokio::spawn(async move {
            let mut rng = OsRng;
            while let Some(frame) = tun_rx.recv().await {
                match egress_peer.eth_process(&frame, &mut rng).await {
                    Ok(Some(wire)) => {
                        if write_half.write_all(&wire).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "failed to encode outbound tcp frame"),
                }
            }
        });

        let mut scanner = TcpFrameScanner::new(1 << 20);
        let result: crate::Result<()> = 'outer: loop {
            let expected = peer.expected_encrypted_nonce().await;
            loop {
                if let Some(frame) = scanner.next_frame(&expected) {
                    match peer.pkt_process(&frame, false).await {
                        Ok(PktOutcome::Payload(data)) => {
                            let _ = tun_tx.send(data).await;
                        }
                        Ok(PktOutcome::Heartbeat) => {}
                        Err(e) => tracing::debug!(%addr, error = %e, "dropped invalid tcp frame"),
                    }
                    if peer.needs_rehandshake() {
                        tracing::info!(%addr, "byte budget exceeded, closing tcp connection for rehandshake");
                        break 'outer Ok(());
                    }
                    break;
                }
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => break 'outer Ok(()),
                    Ok(n) => n,
                    Err(e) => break 'outer Err(e.into()),
                };
                if let Err(e) = scanner.feed(&buf[..n]) {
                    break 'outer Err(e);
                }
            }
        };
        egress.abort();
        result
    }
}
