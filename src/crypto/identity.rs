//! Peer identities and the XTEA identity cache used to classify inbound
//! packets by sender in O(peers) without a connection handle, grounded
//! on `identity.go`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::Serialize;

use crate::conf::PeerConf;
use crate::crypto::xtea::{XteaCipher, BLOCK_SIZE};

pub const ID_SIZE: usize = 128 / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; ID_SIZE]);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct CipherAndTimeSync {
    cipher: XteaCipher,
    time_sync: i64,
}

/// Maps each configured peer's identity to its ready-to-use XTEA
/// cipher, rebuilt incrementally as the configuration reloads.
pub struct CipherCache {
    entries: RwLock<HashMap<PeerId, CipherAndTimeSync>>,
}

impl CipherCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drops ciphers for peers no longer present in `peers`, and adds
    /// ciphers for newly-appeared ones; refreshes `time_sync` for peers
    /// that persist.
    pub fn update(&self, peers: &HashMap<PeerId, PeerConf>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        entries.retain(|pid, _| {
            let keep = peers.contains_key(pid);
            if !keep {
                tracing::info!(peer = %pid, "removing stale identity cache entry");
            }
            keep
        });

        for (pid, conf) in peers {
            if let Some(existing) = entries.get_mut(pid) {
                existing.time_sync = conf.time_sync;
            } else {
                tracing::info!(peer = %pid, "adding identity cache entry");
                entries.insert(
                    *pid,
                    CipherAndTimeSync {
                        cipher: XteaCipher::new(&pid.0),
                        time_sync: conf.time_sync,
                    },
                );
            }
        }
    }

    /// Attempts to identify the sender of `data`: the first `BLOCK_SIZE`
    /// bytes are the plaintext identity tag, the last `BLOCK_SIZE` bytes
    /// its XTEA encryption under the candidate peer's identity key.
    pub fn find(&self, data: &[u8]) -> Option<PeerId> {
        if data.len() < BLOCK_SIZE * 2 {
            return None;
        }
        let tag = &data[..BLOCK_SIZE];
        let ciphertext: [u8; BLOCK_SIZE] = data[data.len() - BLOCK_SIZE..].try_into().ok()?;

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        for (pid, cat) in entries.iter() {
            let mut buf = ciphertext;
            cat.cipher.decrypt(&mut buf);
            add_time_sync(cat.time_sync, &mut buf);
            if subtle_eq(&buf, tag) {
                return Some(*pid);
            }
        }
        None
    }
}

impl Default for CipherCache {
    fn default() -> Self {
        Self::new()
    }
}

/// XORs the first 8 bytes of `data` with the current Unix time quantized
/// down to a `time_sync`-second bucket, when `time_sync > 0`.
pub fn add_time_sync(time_sync: i64, data: &mut [u8]) {
    if time_sync <= 0 {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let bucket = (now / time_sync) * time_sync;
    let bucket_bytes = bucket.to_be_bytes();
    for i in 0..8.min(data.len()) {
        data[i] ^= bucket_bytes[i];
    }
}

fn subtle_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).unwrap_u8() == 1
}

/// Computes the 8-byte IDtag trailer for a handshake or transport
/// message: `XTEA.Encrypt(id, first8(payload) XOR timestamp(time_sync))`.
/// Appended by the sender; reproduced and compared by `CipherCache::find`
/// (and, once a peer is already known, directly against its own id) on
/// the receiving side.
pub fn make_id_tag(id: &PeerId, time_sync: i64, payload: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut prefix = [0u8; BLOCK_SIZE];
    let n = payload.len().min(BLOCK_SIZE);
    prefix[..n].copy_from_slice(&payload[..n]);
    add_time_sync(time_sync, &mut prefix);
    let cipher = XteaCipher::new(&id.0);
    cipher.encrypt(&mut prefix);
    prefix
}

/// Verifies `payload`'s trailing IDtag against a known `id`, without
/// going through the cache (used once a peer or in-progress handshake is
/// already bound to an address).
pub fn verify_id_tag(id: &PeerId, time_sync: i64, payload: &[u8]) -> bool {
    if payload.len() < BLOCK_SIZE * 2 {
        return false;
    }
    let tag = &payload[..BLOCK_SIZE];
    let mut ciphertext: [u8; BLOCK_SIZE] = payload[payload.len() - BLOCK_SIZE..]
        .try_into()
        .unwrap();
    let cipher = XteaCipher::new(&id.0);
    cipher.decrypt(&mut ciphertext);
    add_time_sync(time_sync, &mut ciphertext);
    subtle_eq(&ciphertext, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_identifies_known_peer() {
        let cache = CipherCache::new();
        let pid = PeerId([3u8; ID_SIZE]);
        let mut peers = HashMap::new();
        peers.insert(
            pid,
            PeerConf {
                time_sync: 0,
                ..PeerConf::test_default(pid)
            },
        );
        cache.update(&peers);

        let cipher = XteaCipher::new(&pid.0);
        let tag = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut ciphertext = tag;
        cipher.encrypt(&mut ciphertext);

        let mut data = Vec::new();
        data.extend_from_slice(&tag);
        data.extend_from_slice(&ciphertext);

        assert_eq!(cache.find(&data), Some(pid));
    }

    #[test]
    fn find_rejects_unknown_peer() {
        let cache = CipherCache::new();
        let data = vec![0u8; BLOCK_SIZE * 2];
        assert_eq!(cache.find(&data), None);
    }

    #[test]
    fn update_evicts_removed_peers() {
        let cache = CipherCache::new();
        let pid = PeerId([9u8; ID_SIZE]);
        let mut peers = HashMap::new();
        peers.insert(pid, PeerConf::test_default(pid));
        cache.update(&peers);
        cache.update(&HashMap::new());

        let data = vec![0u8; BLOCK_SIZE * 2];
        assert_eq!(cache.find(&data), None);
    }
}
