//! UDP transport for the client role: one handshake against a single
//! remote address, followed by a long-running session that re-runs the
//! handshake in place (the design notes' "atomic swap during
//! rehandshake") whenever the byte budget is exhausted, all while the
//! TAP device and UDP socket stay open underneath it.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use crate::conf::PeerConf;
use crate::config::ClientFile;
use crate::device::{TunConfig, TunDevice};
use crate::handshake::Handshake;
use crate::peer::{Peer, PktOutcome};
use crate::scripts;

const HANDSHAKE_RETRY: Duration = Duration::from_secs(2);
const HANDSHAKE_ATTEMPTS: u32 = 30;

/// Runs one leg of the client handshake (M1 -> M2 -> M3 -> M4) against
/// `socket`, retrying M1 on timeout -- the counterpart's UDP listener is
/// stateless per-address until M1 actually arrives, so a dropped M1 or
/// M2 is safe to simply resend.
async fn handshake(socket: &UdpSocket, conf: &PeerConf) -> crate::Result<Peer> {
    let mut rng = OsRng;
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        let (mut hs, m1) = Handshake::client_m1(conf, &mut rng)?;
        socket.send(&m1).await?;

        let mut buf = vec![0u8; 2 * conf.mtu + 256];
        let m2 = match tokio::time::timeout(HANDSHAKE_RETRY, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => buf[..n].to_vec(),
            _ => {
                tracing::debug!(attempt, "no handshake reply (m2), retrying");
                continue;
            }
        };
        let m3 = match hs.client_recv_m2(&m2, &mut rng) {
            Ok(m3) => m3,
            Err(e) => {
                tracing::debug!(attempt, error = %e, "m2 rejected, retrying");
                continue;
            }
        };
        socket.send(&m3).await?;

        let m4 = match tokio::time::timeout(HANDSHAKE_RETRY, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => buf[..n].to_vec(),
            _ => {
                tracing::debug!(attempt, "no handshake reply (m4), retrying");
                continue;
            }
        };
        match hs.client_recv_m4(&m4) {
            Ok(peer) => return Ok(peer),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "m4 rejected, retrying");
                continue;
            }
        }
    }
    Err("handshake did not complete after maximum retries".into())
}

pub async fn run(file: ClientFile, conf: PeerConf) -> crate::Result<()> {
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    socket.connect(&file.remote).await?;

    let peer = handshake(&socket, &conf).await?;
    tracing::info!(peer = %peer.id, "session promoted");
    let current = Arc::new(RwLock::new(Arc::new(peer)));

    let tun = TunDevice::create(TunConfig {
        name: conf.iface.clone(),
        address: file.tun.address.clone(),
        netmask: file.tun.netmask.clone(),
        mtu: conf.mtu as u16,
    })
    .await?;
    let (tun_tx, mut tun_rx) = tun.split();

    if let Some(up) = &conf.up {
        let up = up.clone();
        let iface = conf.iface.clone();
        let remote = file.remote.clone();
        tokio::spawn(async move { scripts::run_hook(Some(&up), &iface, &remote).await });
    }

    let egress_socket = socket.clone();
    let egress_current = current.clone();
    let egress = tokio::spawn(async move {
        let mut rng = OsRng;
        while let Some(frame) = tun_rx.recv().await {
            let peer = egress_current.read().await.clone();
            match peer.eth_process(&frame, &mut rng).await {
                Ok(Some(wire)) => {
                    if let Err(e) = egress_socket.send(&wire).await {
                        tracing::warn!(error = %e, "failed to send transport packet");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "failed to encode outbound frame"),
            }
        }
    });

    let rehandshake_socket = socket.clone();
    let rehandshake_current = current.clone();
    let rehandshake_conf = conf.clone();
    let rehandshake = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let needs = rehandshake_current.read().await.needs_rehandshake();
            if !needs {
                continue;
            }
            tracing::info!("byte budget exceeded, rehandshaking");
            match handshake(&rehandshake_socket, &rehandshake_conf).await {
                Ok(new_peer) => {
                    *rehandshake_current.write().await = Arc::new(new_peer);
                    tracing::info!("rehandshake complete");
                }
                Err(e) => tracing::error!(error = %e, "rehandshake failed"),
            }
        }
    });

    let mut buf = vec![0u8; 65536];
    let result: crate::Result<()> = loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };
        let peer = current.read().await.clone();
        match peer.pkt_process(&buf[..n], true).await {
            Ok(PktOutcome::Payload(frame)) => {
                if let Err(e) = tun_tx.send(frame).await {
                    tracing::warn!(error = %e, "failed to write frame to tap device");
                }
            }
            Ok(PktOutcome::Heartbeat) => {}
            Err(e) => tracing::debug!(error = %e, "dropped invalid transport packet"),
        }
    };
    egress.abort();
    rehandshake.abort();
    result
}
