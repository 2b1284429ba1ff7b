//! Per-peer configuration: the data the handshake and transport pipeline
//! are parameterized over. Grounded on the `PeerConf`/`PeerId` records in
//! `src.go`/`cmd/govpn-server/main.go` of the original daemon; adapted to
//! the host stack's `serde`+`toml` configuration idiom instead of YAML.

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::SigningKey;

use crate::crypto::identity::PeerId;
use crate::crypto::verifier::Verifier;

/// Byte budget per session key before a rehandshake is required (2^32).
pub const MAX_BYTES_PER_KEY: u64 = 1 << 32;

/// Number of nonces held per replay-detection bucket.
pub const NONCE_BUCKET_SIZE: usize = 128;

/// Marks the end of payload within a decrypted plaintext frame.
pub const PAD_BYTE: u8 = 0x80;

/// Smallest legal standard-mode transport frame: tag(16) + payload(1) + nonce(8).
pub const MIN_PKT_LENGTH: usize = 25;

/// Immutable per-peer configuration, shared by client and server.
#[derive(Debug, Clone)]
pub struct PeerConf {
    pub id: PeerId,
    pub iface: String,
    pub mtu: usize,
    pub timeout: Duration,
    pub noise: bool,
    /// Constant packet rate target, KiB/s; 0 disables shaping.
    pub cpr: u32,
    pub encless: bool,
    /// Time-sync quantum in seconds for IDtag freshness; 0 disables.
    pub time_sync: i64,
    pub up: Option<String>,
    pub down: Option<String>,
    pub verifier: Verifier,
    /// Present only for the client's own identity: the password-derived
    /// Ed25519 private key used to sign the session key in M3.
    pub dsa_priv: Option<SigningKey>,
}

impl PeerConf {
    /// CPR cycle duration derived from the configured rate and MTU, or
    /// `None` if shaping is disabled.
    pub fn cpr_cycle(&self) -> Option<Duration> {
        if self.cpr == 0 {
            return None;
        }
        let bytes_per_sec = self.cpr as u64 * 1024;
        if bytes_per_sec == 0 {
            return None;
        }
        let micros = (self.mtu as u64 * 1_000_000) / bytes_per_sec;
        Some(Duration::from_micros(micros.max(1)))
    }

    #[cfg(test)]
    pub fn test_default(id: PeerId) -> Self {
        let mut verifier = Verifier::new(
            crate::crypto::verifier::DEFAULT_M,
            crate::crypto::verifier::DEFAULT_T,
            crate::crypto::verifier::DEFAULT_P,
            id,
        );
        let priv_key = verifier.password_apply("test password").unwrap();
        Self {
            id,
            iface: "tap0".to_string(),
            mtu: 1500,
            timeout: Duration::from_secs(60),
            noise: false,
            cpr: 0,
            encless: false,
            time_sync: 0,
            up: None,
            down: None,
            verifier,
            dsa_priv: Some(priv_key),
        }
    }
}

pub type PeerTable = HashMap<PeerId, PeerConf>;
