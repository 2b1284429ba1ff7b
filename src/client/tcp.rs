//! TCP transport for the client role: connects once, completes the
//! handshake over the stream, then runs the same scan-for-next-nonce
//! framing the server's TCP listener uses. A dropped connection tears
//! the whole session down -- TCP mode has no rehandshake-in-place,
//! matching `Peer`'s exact-sequencing replay policy (a gap terminates
//! the session rather than tolerating reordering). Rehandshake still
//! happens once the byte budget is exceeded, just by reconnecting and
//! running the handshake fresh rather than swapping keys mid-stream.

use std::time::Duration;

use rand::rngs::OsRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::conf::PeerConf;
use crate::config::ClientFile;
use crate::device::{TunConfig, TunDevice};
use crate::handshake::Handshake;
use crate::peer::PktOutcome;
use crate::scripts;
use crate::transport::TcpFrameScanner;

pub async fn run(file: ClientFile, conf: PeerConf) -> crate::Result<()> {
    let mut backoff = 1u64;
    loop {
        match run_once(&file, &conf).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, backoff, "tcp session ended, reconnecting");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(64);
            }
        }
    }
}

async fn run_once(file: &ClientFile, conf: &PeerConf) -> crate::Result<()> {
    let mut stream = TcpStream::connect(&file.remote).await?;
    let mut rng = OsRng;

    let (mut hs, m1) = Handshake::client_m1(conf, &mut rng)?;
    stream.write_all(&m1).await?;

    let mut buf = vec![0u8; 2 * conf.mtu + 256];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err("connection closed during handshake".into());
    }
    let m3 = hs.client_recv_m2(&buf[..n], &mut rng)?;
    stream.write_all(&m3).await?;

    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err("connection closed during handshake".into());
    }
    let peer = hs.client_recv_m4(&buf[..n])?;
    tracing::info!(peer = %peer.id, "tcp session promoted");

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

    let peer = std::sync::Arc::new(peer);
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
                    Err(e) => tracing::debug!(error = %e, "dropped invalid tcp frame"),
                }
                if peer.needs_rehandshake() {
                    tracing::info!("byte budget exceeded, reconnecting to rehandshake");
                    break 'outer Err("rehandshake required".into());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_64_seconds() {
        let mut backoff = 1u64;
        for _ in 0..10 {
            backoff = (backoff * 2).min(64);
        }
        assert_eq!(backoff, 64);
    }
}
