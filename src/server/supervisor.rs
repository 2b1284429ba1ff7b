//! UDP session supervisor for the server role: tracks in-progress
//! handshakes and live peers by address and by identity, and owns the
//! TAP device each promoted peer forwards Ethernet frames through.
//! Grounded on the map-of-maps shape of `server/connection_manager.rs`
//! and `server/server.rs`, replumbed onto the new handshake/peer engine.
//! TCP sessions are handled separately (see `server::tcp`): a TCP
//! stream already serializes one connection's state, so it manages its
//! own local handshake/peer/TAP lifecycle rather than sharing these maps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::OsRng;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use crate::conf::{PeerConf, PeerTable};
use crate::config::TunFile;
use crate::crypto::identity::{CipherCache, PeerId};
use crate::device::{TunConfig, TunDevice, TunSender};
use crate::handshake::Handshake;
use crate::peer::{Peer, PktOutcome};
use crate::scripts;

/// A promoted session: the transport pipeline plus a handle to the TAP
/// device its decrypted frames are forwarded through.
struct Session {
    peer: Arc<Peer>,
    tun: TunSender,
}

/// Tracks every in-progress handshake and live session for the server's
/// UDP listener. Whenever an operation needs more than one map, locks
/// are always taken in the order handshakes -> peers -> peers_by_id ->
/// known_peers, matching the reference daemon's fixed lock-acquisition
/// order so two concurrent operations can never deadlock against each
/// other.
pub struct Supervisor {
    handshakes: RwLock<HashMap<SocketAddr, Handshake>>,
    peers: RwLock<HashMap<SocketAddr, Session>>,
    peers_by_id: RwLock<HashMap<PeerId, SocketAddr>>,
    known_peers: RwLock<PeerTable>,
    cache: CipherCache,
    tun_file: TunFile,
    socket: Arc<UdpSocket>,
}

impl Supervisor {
    pub fn new(known_peers: PeerTable, tun_file: TunFile, socket: Arc<UdpSocket>) -> Arc<Self> {
        let cache = CipherCache::new();
        cache.update(&known_peers);
        Arc::new(Self {
            handshakes: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            peers_by_id: RwLock::new(HashMap::new()),
            known_peers: RwLock::new(known_peers),
            cache,
            tun_file,
            socket,
        })
    }

    /// Applies a reloaded peer table: refreshes the identity cache.
    /// Live sessions for peers no longer present keep running until
    /// their own timeout expires -- reload only affects new handshakes.
    pub async fn reload(&self, peers: PeerTable) {
        self.cache.update(&peers);
        *self.known_peers.write().await = peers;
    }

    async fn peer_conf(&self, id: &PeerId) -> Option<PeerConf> {
        self.known_peers.read().await.get(id).cloned()
    }

    async fn create_tun(&self, iface: &str, mtu: usize) -> crate::Result<TunDevice> {
        TunDevice::create(TunConfig {
            name: iface.to_string(),
            address: self.tun_file.address.clone(),
            netmask: self.tun_file.netmask.clone(),
            mtu: mtu as u16,
        })
        .await
    }

    /// Handles one inbound UDP datagram from `addr`: routes it to an
    /// in-progress handshake continuation, a fresh handshake (identity
    /// cache classification), or a live session's transport pipeline.
    ///
    /// The identity cache check runs *before* the live-session check, not
    /// after: a rehandshake's M1 arrives from the same address as the
    /// live session it is about to replace (the client reuses its UDP
    /// socket), so if the live-session branch took priority a fresh M1
    /// would be handed to `pkt_process` as transport ciphertext, fail
    /// authentication, and the rehandshake would never complete server
    /// side. A spurious cache match against genuine transport ciphertext
    /// is not a practical concern -- the IDtag only verifies for data
    /// actually produced under the matching XTEA key.
    pub async fn handle_udp(self: &Arc<Self>, data: &[u8], addr: SocketAddr) {
        let in_progress = self.handshakes.write().await.remove(&addr);
        if let Some(mut hs) = in_progress {
            match hs.server_recv_m3(data) {
                Ok((reply, peer)) => {
                    let _ = self.socket.send_to(&reply, addr).await;
                    self.promote(addr, peer).await;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "handshake m3 rejected");
                }
            }
            return;
        }

        if let Some(pid) = self.cache.find(data) {
            if let Some(conf) = self.peer_conf(&pid).await {
                let mut rng = OsRng;
                match Handshake::server_recv_m1(&conf, data, &mut rng) {
                    Ok((hs, reply)) => {
                        let _ = self.socket.send_to(&reply, addr).await;
                        self.handshakes.write().await.insert(addr, hs);
                        return;
                    }
                    Err(e) => tracing::debug!(%addr, error = %e, "handshake m1 rejected"),
                }
            }
        }

        let live = {
            let peers = self.peers.read().await;
            peers.get(&addr).map(|s| (s.peer.clone(), s.tun.clone()))
        };
        match live {
            Some((peer, tun)) => match peer.pkt_process(data, true).await {
                Ok(PktOutcome::Payload(frame)) => {
                    if let Err(e) = tun.send(frame).await {
                        tracing::warn!(%addr, error = %e, "failed to write frame to tap device");
                    }
                }
                Ok(PktOutcome::Heartbeat) => {}
                Err(e) => tracing::debug!(%addr, error = %e, "dropped invalid transport packet"),
            },
            None => tracing::debug!(%addr, "unidentified inbound datagram, dropping"),
        }
    }

    /// Promotes a completed handshake into a live session, reusing the
    /// previous session's TAP device if this address already had one
    /// (a rehandshake), bringing up a fresh device otherwise. Runs the
    /// peer's up-hook once a fresh session is in place.
    async fn promote(self: &Arc<Self>, addr: SocketAddr, peer: Peer) {
        let conf = self.peer_conf(&peer.id).await;
        let iface = conf.as_ref().map(|c| c.iface.clone()).unwrap_or_else(|| "tap0".into());
        let up_hook = conf.as_ref().and_then(|c| c.up.clone());

        let existing = self.peers.write().await.remove(&addr);
        let (tun, reused) = match existing {
            Some(sess) => (sess.tun, true),
            None => match self.create_tun(&iface, peer.mtu()).await {
                Ok(dev) => {
                    let (sender, receiver) = dev.split();
                    let sup = self.clone();
                    tokio::spawn(async move { sup.run_egress(addr, receiver).await });
                    (sender, false)
                }
                Err(e) => {
                    tracing::error!(%addr, error = %e, "failed to bring up tap device");
                    return;
                }
            },
        };

        let peer = Arc::new(peer);
        self.peers_by_id.write().await.insert(peer.id, addr);
        self.peers.write().await.insert(
            addr,
            Session {
                peer: peer.clone(),
                tun,
            },
        );
        tracing::info!(%addr, peer = %peer.id, rehandshake = reused, "session promoted");

        if !reused {
            let remote = addr.to_string();
            tokio::spawn(async move { scripts::run_hook(up_hook.as_deref(), &iface, &remote).await });
        }
    }

    /// Drains Ethernet frames off the TAP device for `addr`, encrypts
    /// each one under the current peer at that address, and sends it
    /// out over the shared UDP socket. Re-reads the peer from the map
    /// on every iteration so a rehandshake's fresh `Peer` takes over
    /// without restarting this task or the TAP device underneath it.
    async fn run_egress(self: Arc<Self>, addr: SocketAddr, mut receiver: crate::device::TunReceiver) {
        let mut rng = OsRng;
        while let Some(frame) = receiver.recv().await {
            let peer = { self.peers.read().await.get(&addr).map(|s| s.peer.clone()) };
            let Some(peer) = peer else {
                tracing::info!(%addr, "session gone, stopping tap egress");
                return;
            };
            match peer.eth_process(&frame, &mut rng).await {
                Ok(Some(wire)) => {
                    if let Err(e) = self.socket.send_to(&wire, addr).await {
                        tracing::warn!(%addr, error = %e, "failed to send transport packet");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(%addr, error = %e, "failed to encode outbound frame"),
            }
        }
    }

    /// Periodic maintenance: closes handshakes that timed out waiting
    /// for a reply.
    pub async fn reap_stale_handshakes(&self) {
        let mut handshakes = self.handshakes.write().await;
        let before = handshakes.len();
        handshakes.retain(|_, hs| !hs.timed_out());
        let reaped = before - handshakes.len();
        if reaped > 0 {
            tracing::debug!(count = reaped, "reaped timed-out handshakes");
        }
    }

    pub async fn snapshot(&self) -> Vec<crate::stats::PeerSnapshot> {
        let peers = self.peers.read().await;
        let mut out = Vec::with_capacity(peers.len());
        for (addr, session) in peers.iter() {
            out.push(crate::stats::PeerSnapshot::from_peer(*addr, &session.peer).await);
        }
        out
    }
}
