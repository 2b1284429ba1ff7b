//! JSON statistics endpoint: serves a live snapshot of every promoted
//! peer session. Adapted from `client/http/{models,handlers,server}.rs`
//! -- the original caches a separately-pushed `StatusResponse`; this
//! reads straight off the supervisor's peer map on each request instead,
//! since that map is already safe to read concurrently.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::peer::Peer;
use crate::server::Supervisor;

#[derive(Serialize, Debug, Clone)]
pub struct PeerSnapshot {
    pub addr: String,
    pub id: String,
    pub mtu: usize,
    pub noise: bool,
    pub encless: bool,
    /// Constant-packet-rate target, KiB/s; 0 means shaping is disabled.
    pub cpr: u32,
    /// Seconds since the last packet (heartbeat or data) was received.
    pub idle_secs: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_unauth: u64,
    pub frames_dup: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_recv: u64,
}

impl PeerSnapshot {
    pub async fn from_peer(addr: SocketAddr, peer: &Peer) -> Self {
        Self {
            addr: addr.to_string(),
            id: peer.id.to_string(),
            mtu: peer.mtu(),
            noise: peer.noise(),
            encless: peer.encless(),
            cpr: peer.cpr(),
            idle_secs: peer.idle_for().await.as_secs_f64(),
            bytes_in: peer.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: peer.counters.bytes_out.load(Ordering::Relaxed),
            frames_in: peer.counters.frames_in.load(Ordering::Relaxed),
            frames_out: peer.counters.frames_out.load(Ordering::Relaxed),
            bytes_unauth: peer.counters.bytes_unauth.load(Ordering::Relaxed),
            frames_dup: peer.counters.frames_dup.load(Ordering::Relaxed),
            heartbeats_sent: peer.counters.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_recv: peer.counters.heartbeats_recv.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "govpn" }))
}

async fn peers(State(state): State<AppState>) -> Json<Vec<PeerSnapshot>> {
    Json(state.supervisor.snapshot().await)
}

/// Serves `GET /peers` and `GET /health` on `addr` until the process
/// exits. Errors from `axum::serve` are fatal to the calling task, same
/// as the original HTTP status server.
pub async fn serve(addr: &str, supervisor: Arc<Supervisor>) -> crate::Result<()> {
    let app = Router::new()
        .route("/peers", get(peers))
        .route("/health", get(health))
        .with_state(AppState { supervisor });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "stats server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
