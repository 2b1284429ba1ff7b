//! PAKE-style mutually-authenticated handshake, grounded on `handshake.go`.
//!
//! Four messages, two round trips, building toward a 32-byte session key
//! `K = sServer XOR sClient` that only promotes to a [`Peer`](crate::peer::Peer)
//! once both sides have proven liveness and the client has proven
//! possession of the passphrase behind its [`PeerConf::verifier`].
//!
//! Every message ends with an 8-byte IDtag (`crypto::identity::make_id_tag`)
//! binding it to the sender's identity and a coarse timestamp; that part
//! is stripped/verified by the caller before the bytes reach this module,
//! since picking which [`PeerConf`] applies is the identity cache's job,
//! not the handshake's.

use rand::RngCore;
use zeroize::Zeroize;

use crate::conf::PeerConf;
use crate::crypto::elligator::{dh, dh_keypair_gen, representative_to_public};
use crate::crypto::encless;
use crate::crypto::error::{CryptoError, Result};
use crate::crypto::identity::make_id_tag;
use crate::crypto::primitives::{blake2b_256, ed25519_sign, ed25519_verify, salsa20_xor};
use crate::peer::{Peer, Role as PeerRole};

const R_SIZE: usize = 8;
const S_SIZE: usize = 32;
const DH_SIZE: usize = 32;
const SIG_SIZE: usize = 64;
const ID_TAG_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Client: sent M1, waiting for M2. Server: sent M2, waiting for M3.
    AwaitingReply,
    /// Server only: received M1, about to send M2 (never observed externally).
    Promoted,
}

/// Session-in-progress state bound to one remote address.
pub struct Handshake {
    role: Role,
    conf: PeerConf,
    stage: Stage,
    dh_priv: [u8; DH_SIZE],
    nonce_base: [u8; R_SIZE],
    dsa_pub_hash: [u8; 32],
    session_key: Option<[u8; 32]>,
    r_server: Option<[u8; R_SIZE]>,
    r_client: Option<[u8; R_SIZE]>,
    s_server: Option<[u8; S_SIZE]>,
    s_client: Option<[u8; S_SIZE]>,
    last_activity: std::time::Instant,
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.dh_priv.zeroize();
        if let Some(k) = self.session_key.as_mut() {
            k.zeroize();
        }
        if let Some(s) = self.s_server.as_mut() {
            s.zeroize();
        }
        if let Some(s) = self.s_client.as_mut() {
            s.zeroize();
        }
    }
}

fn pad_to(mut data: Vec<u8>, len: usize) -> Result<Vec<u8>> {
    if data.len() > len {
        return Err(CryptoError::Overflow);
    }
    data.resize(len, 0);
    Ok(data)
}

fn incr(r: &[u8; R_SIZE], n: u64) -> [u8; R_SIZE] {
    (u64::from_be_bytes(*r).wrapping_add(n)).to_be_bytes()
}

fn dsa_pub_hash(conf: &PeerConf) -> Result<[u8; 32]> {
    let public = conf.verifier.public.ok_or(CryptoError::BadStructure)?;
    Ok(blake2b_256(public.as_bytes()))
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).unwrap_u8() == 1
}

/// Wraps a payload field with the obfuscation cipher (Salsa20 keyed by
/// `DSAPubH`) when not in `Encless` mode, or with the full encryptionless
/// codec (which supplies its own confidentiality and integrity) when it
/// is. `pad_len`, when given, is folded into the field *before* sealing --
/// the padding becomes part of the ciphertext rather than a plaintext
/// suffix appended afterwards, so a noise-mode message is uniform
/// ciphertext end to end instead of exposing the real field's length
/// as a run of unencrypted zero bytes.
fn seal_field(
    conf: &PeerConf,
    key: &[u8; 32],
    nonce: &[u8; R_SIZE],
    field: &[u8],
    pad_len: Option<usize>,
    rng: &mut dyn RngCore,
) -> Result<Vec<u8>> {
    let padded = pad_to(field.to_vec(), pad_len.unwrap_or(field.len()))?;
    if conf.encless {
        Ok(encless::encode(rng, key, nonce, &padded))
    } else {
        let mut out = padded;
        salsa20_xor(key, nonce, &mut out);
        Ok(out)
    }
}

fn open_field(
    conf: &PeerConf,
    key: &[u8; 32],
    nonce: &[u8; R_SIZE],
    field: &[u8],
    plain_len: usize,
) -> Result<Vec<u8>> {
    if conf.encless {
        let mut out = encless::decode(key, nonce, field)?;
        out.truncate(plain_len);
        Ok(out)
    } else {
        let mut out = field.to_vec();
        salsa20_xor(key, nonce, &mut out);
        Ok(out)
    }
}

fn encless_field_len(conf: &PeerConf) -> usize {
    conf.mtu + encless::ENLARGE_SIZE
}

fn append_id_tag(conf: &PeerConf, msg: &mut Vec<u8>) {
    let tag = make_id_tag(&conf.id, conf.time_sync, msg);
    msg.extend_from_slice(&tag);
}

fn strip_id_tag(msg: &[u8]) -> Result<&[u8]> {
    if msg.len() < ID_TAG_SIZE {
        return Err(CryptoError::BadLength);
    }
    Ok(&msg[..msg.len() - ID_TAG_SIZE])
}

impl Handshake {
    /// Client: begins a handshake, returning the M1 bytes to send.
    pub fn client_m1(conf: &PeerConf, rng: &mut dyn RngCore) -> Result<(Self, Vec<u8>)> {
        let dsa_pub_hash = dsa_pub_hash(conf)?;
        let mut r = [0u8; R_SIZE];
        rng.fill_bytes(&mut r);
        let (dh_priv, repr) = dh_keypair_gen(rng);

        let mut msg = Vec::with_capacity(conf.mtu);
        msg.extend_from_slice(&r);
        // Noise mode: field is padded to fill the message exactly to `mtu`
        // once `r` and the IDtag are accounted for. Encless pads to a full
        // `mtu`-sized pre-image per the encryptionless codec's own contract.
        let field_pad_len = if conf.encless {
            Some(conf.mtu)
        } else if conf.noise {
            Some(conf.mtu - R_SIZE - ID_TAG_SIZE)
        } else {
            None
        };
        let sealed = seal_field(conf, &dsa_pub_hash, &r, &repr, field_pad_len, rng)?;
        msg.extend_from_slice(&sealed);
        append_id_tag(conf, &mut msg);

        let hs = Handshake {
            role: Role::Client,
            conf: conf.clone(),
            stage: Stage::AwaitingReply,
            dh_priv,
            nonce_base: r,
            dsa_pub_hash,
            session_key: None,
            r_server: None,
            r_client: None,
            s_server: None,
            s_client: None,
            last_activity: std::time::Instant::now(),
        };
        Ok((hs, msg))
    }

    /// Server: starts a fresh per-address handshake awaiting M1 (no bytes
    /// produced yet -- mirrors the reference's "created on first inbound
    /// handshake byte" lifecycle, where the object exists only once M1
    /// has actually been parsed).
    fn new_server(conf: &PeerConf) -> Result<Self> {
        Ok(Handshake {
            role: Role::Server,
            conf: conf.clone(),
            stage: Stage::AwaitingReply,
            dh_priv: [0u8; DH_SIZE],
            nonce_base: [0u8; R_SIZE],
            dsa_pub_hash: dsa_pub_hash(conf)?,
            session_key: None,
            r_server: None,
            r_client: None,
            s_server: None,
            s_client: None,
            last_activity: std::time::Instant::now(),
        })
    }

    /// Server: processes M1, returns the fresh handshake plus M2 bytes.
    pub fn server_recv_m1(
        conf: &PeerConf,
        msg: &[u8],
        rng: &mut dyn RngCore,
    ) -> Result<(Self, Vec<u8>)> {
        let mut hs = Self::new_server(conf)?;
        let body = strip_id_tag(msg)?;
        if body.len() < R_SIZE {
            return Err(CryptoError::BadStructure);
        }
        let r: [u8; R_SIZE] = body[..R_SIZE].try_into().unwrap();
        let field = &body[R_SIZE..];

        let repr_bytes = open_field(conf, &hs.dsa_pub_hash, &r, field, DH_SIZE)?;
        if repr_bytes.len() < DH_SIZE {
            return Err(CryptoError::BadLength);
        }
        let repr: [u8; DH_SIZE] = repr_bytes[..DH_SIZE].try_into().unwrap();
        let client_pub = representative_to_public(&repr);

        let (server_priv, server_repr) = dh_keypair_gen(rng);
        let shared = dh(&server_priv, &client_pub);
        let k = blake2b_256(&shared);

        let mut r_server = [0u8; R_SIZE];
        rng.fill_bytes(&mut r_server);
        let mut s_server = [0u8; S_SIZE];
        rng.fill_bytes(&mut s_server);

        hs.nonce_base = r;
        hs.dh_priv = server_priv;
        hs.session_key = Some(k);
        hs.r_server = Some(r_server);
        hs.s_server = Some(s_server);

        let r_plus1 = incr(&r, 1);
        let mut msg_out = Vec::with_capacity(2 * conf.mtu);
        // The DH representative field is never padded beyond its own size --
        // it is already a uniformly-random 32 bytes before encryption, noise
        // or not. Only the second field absorbs padding, out to whatever is
        // left of `mtu` once the first field and the IDtag are accounted for.
        let part1_pad_len = if conf.encless { Some(conf.mtu) } else { None };
        let part1 = seal_field(conf, &hs.dsa_pub_hash, &r_plus1, &server_repr, part1_pad_len, rng)?;
        msg_out.extend_from_slice(&part1);

        let mut secret = Vec::with_capacity(R_SIZE + S_SIZE);
        secret.extend_from_slice(&r_server);
        secret.extend_from_slice(&s_server);
        let part2_pad_len = if conf.encless {
            Some(conf.mtu)
        } else if conf.noise {
            Some(conf.mtu - part1.len() - ID_TAG_SIZE)
        } else {
            None
        };
        let part2 = seal_field(conf, &k, &r, &secret, part2_pad_len, rng)?;
        msg_out.extend_from_slice(&part2);

        append_id_tag(conf, &mut msg_out);
        Ok((hs, msg_out))
    }

    /// Client: processes M2, returns M3 bytes.
    pub fn client_recv_m2(&mut self, msg: &[u8], rng: &mut dyn RngCore) -> Result<Vec<u8>> {
        if self.role != Role::Client || self.stage != Stage::AwaitingReply {
            return Err(CryptoError::BadStructure);
        }
        let body = strip_id_tag(msg)?;
        let r = self.nonce_base;
        let r_plus1 = incr(&r, 1);

        let (field1, field2) = if self.conf.encless {
            let flen = encless_field_len(&self.conf);
            if body.len() < 2 * flen {
                return Err(CryptoError::BadLength);
            }
            (&body[..flen], &body[flen..2 * flen])
        } else {
            if body.len() < DH_SIZE + R_SIZE + S_SIZE {
                return Err(CryptoError::BadLength);
            }
            (&body[..DH_SIZE], &body[DH_SIZE..DH_SIZE + R_SIZE + S_SIZE])
        };

        let repr_bytes = open_field(&self.conf, &self.dsa_pub_hash, &r_plus1, field1, DH_SIZE)?;
        let repr: [u8; DH_SIZE] = repr_bytes[..DH_SIZE].try_into().unwrap();
        let server_pub = representative_to_public(&repr);
        let shared = dh(&self.dh_priv, &server_pub);
        let k = blake2b_256(&shared);

        let secret = open_field(&self.conf, &k, &r, field2, R_SIZE + S_SIZE)?;
        let r_server: [u8; R_SIZE] = secret[..R_SIZE].try_into().unwrap();
        let s_server: [u8; S_SIZE] = secret[R_SIZE..R_SIZE + S_SIZE].try_into().unwrap();

        self.session_key = Some(k);
        self.r_server = Some(r_server);
        self.s_server = Some(s_server);

        let mut r_client = [0u8; R_SIZE];
        rng.fill_bytes(&mut r_client);
        let mut s_client = [0u8; S_SIZE];
        rng.fill_bytes(&mut s_client);
        self.r_client = Some(r_client);
        self.s_client = Some(s_client);

        let signing_key = self
            .conf
            .dsa_priv
            .as_ref()
            .ok_or(CryptoError::BadStructure)?;
        let sig = ed25519_sign(signing_key, &k);

        let mut payload = Vec::with_capacity(R_SIZE + R_SIZE + S_SIZE + SIG_SIZE);
        payload.extend_from_slice(&r_server);
        payload.extend_from_slice(&r_client);
        payload.extend_from_slice(&s_client);
        payload.extend_from_slice(&sig.to_bytes());

        // M3 carries no leading `r` of its own (it rides on `r+1`), so the
        // field alone fills the message up to the IDtag.
        let field_pad_len = if self.conf.encless {
            Some(self.conf.mtu)
        } else if self.conf.noise {
            Some(self.conf.mtu - ID_TAG_SIZE)
        } else {
            None
        };
        let sealed = seal_field(&self.conf, &k, &r_plus1, &payload, field_pad_len, rng)?;
        let mut msg_out = sealed;
        append_id_tag(&self.conf, &mut msg_out);
        self.last_activity = std::time::Instant::now();
        Ok(msg_out)
    }

    /// Server: processes M3, returns M4 bytes plus the promoted [`Peer`].
    pub fn server_recv_m3(&mut self, msg: &[u8]) -> Result<(Vec<u8>, Peer)> {
        if self.role != Role::Server || self.stage != Stage::AwaitingReply {
            return Err(CryptoError::BadStructure);
        }
        let body = strip_id_tag(msg)?;
        let k = self.session_key.ok_or(CryptoError::BadStructure)?;
        let r = self.nonce_base;
        let r_plus1 = incr(&r, 1);

        let plain_len = R_SIZE + R_SIZE + S_SIZE + SIG_SIZE;
        let payload = open_field(&self.conf, &k, &r_plus1, body, plain_len)?;
        if payload.len() < plain_len {
            return Err(CryptoError::BadLength);
        }
        let r_server_echo = &payload[..R_SIZE];
        let r_client: [u8; R_SIZE] = payload[R_SIZE..2 * R_SIZE].try_into().unwrap();
        let s_client: [u8; S_SIZE] = payload[2 * R_SIZE..2 * R_SIZE + S_SIZE].try_into().unwrap();
        let sig_bytes = &payload[2 * R_SIZE + S_SIZE..plain_len];

        let expected_r_server = self.r_server.ok_or(CryptoError::BadStructure)?;
        if !ct_eq(r_server_echo, &expected_r_server) {
            return Err(CryptoError::BadNonce);
        }

        let public = self.conf.verifier.public.ok_or(CryptoError::BadStructure)?;
        let sig_array: [u8; SIG_SIZE] = sig_bytes.try_into().map_err(|_| CryptoError::BadLength)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_array);
        if !ed25519_verify(&public, &k, &sig) {
            return Err(CryptoError::BadSignature);
        }

        self.r_client = Some(r_client);
        self.s_client = Some(s_client);
        self.stage = Stage::Promoted;

        let s_server = self.s_server.ok_or(CryptoError::BadStructure)?;
        let session_key = xor32(&s_server, &s_client);

        let r_plus2 = incr(&r, 2);
        let field_pad_len = if self.conf.encless {
            Some(self.conf.mtu)
        } else if self.conf.noise {
            Some(self.conf.mtu - ID_TAG_SIZE)
        } else {
            None
        };
        let mut rng = rand::rngs::OsRng;
        let mut msg_out = seal_field(&self.conf, &k, &r_plus2, &r_client, field_pad_len, &mut rng)?;
        append_id_tag(&self.conf, &mut msg_out);

        let peer = Peer::new(PeerRole::Server, self.conf.clone(), session_key);
        Ok((msg_out, peer))
    }

    /// Client: processes M4, returns the promoted [`Peer`].
    pub fn client_recv_m4(&mut self, msg: &[u8]) -> Result<Peer> {
        if self.role != Role::Client || self.stage != Stage::AwaitingReply {
            return Err(CryptoError::BadStructure);
        }
        let body = strip_id_tag(msg)?;
        let k = self.session_key.ok_or(CryptoError::BadStructure)?;
        let r = self.nonce_base;
        let r_plus2 = incr(&r, 2);

        let decrypted = if self.conf.encless {
            let mut out = encless::decode(&k, &r_plus2, body)?;
            out.truncate(R_SIZE);
            out
        } else {
            let mut out = body[..R_SIZE.min(body.len())].to_vec();
            salsa20_xor(&k, &r_plus2, &mut out);
            out
        };
        if decrypted.len() < R_SIZE {
            return Err(CryptoError::BadLength);
        }

        let expected_r_client = self.r_client.ok_or(CryptoError::BadStructure)?;
        if !ct_eq(&decrypted[..R_SIZE], &expected_r_client) {
            return Err(CryptoError::BadNonce);
        }

        self.stage = Stage::Promoted;
        let s_server = self.s_server.ok_or(CryptoError::BadStructure)?;
        let s_client = self.s_client.ok_or(CryptoError::BadStructure)?;
        let session_key = xor32(&s_server, &s_client);
        Ok(Peer::new(PeerRole::Client, self.conf.clone(), session_key))
    }

    pub fn last_activity(&self) -> std::time::Instant {
        self.last_activity
    }

    pub fn timed_out(&self) -> bool {
        self.last_activity.elapsed() > self.conf.timeout
    }
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::{PeerId, ID_SIZE};
    use rand::rngs::OsRng;

    fn client_server_confs() -> (PeerConf, PeerConf) {
        let id = PeerId([42u8; ID_SIZE]);
        let mut server_conf = PeerConf::test_default(id);
        // The client never holds the private key material directly in its
        // verifier; it derives signing key + public from the password at
        // config-load time. Here both share the same verifier state for
        // simplicity, matching `VerifierNew` + `password_apply` on both ends.
        let client_conf = server_conf.clone();
        server_conf.dsa_priv = None;
        (client_conf, server_conf)
    }

    #[test]
    fn full_handshake_round_trip_yields_matching_session_keys() {
        let (client_conf, server_conf) = client_server_confs();
        let mut rng = OsRng;

        let (mut client_hs, m1) = Handshake::client_m1(&client_conf, &mut rng).unwrap();
        let (mut server_hs, m2) = Handshake::server_recv_m1(&server_conf, &m1, &mut rng).unwrap();
        let m3 = client_hs.client_recv_m2(&m2, &mut rng).unwrap();
        let (m4, server_peer) = server_hs.server_recv_m3(&m3).unwrap();
        let client_peer = client_hs.client_recv_m4(&m4).unwrap();

        assert_eq!(
            client_peer.session_key_for_test(),
            server_peer.session_key_for_test()
        );
    }

    #[test]
    fn noise_mode_pads_every_message_to_mtu() {
        let (client_conf, server_conf) = client_server_confs();
        let mut client_conf = client_conf;
        let mut server_conf = server_conf;
        client_conf.noise = true;
        server_conf.noise = true;
        let mut rng = OsRng;

        let (mut client_hs, m1) = Handshake::client_m1(&client_conf, &mut rng).unwrap();
        assert_eq!(m1.len(), client_conf.mtu);
        let (mut server_hs, m2) = Handshake::server_recv_m1(&server_conf, &m1, &mut rng).unwrap();
        assert_eq!(m2.len(), server_conf.mtu);
        let m3 = client_hs.client_recv_m2(&m2, &mut rng).unwrap();
        assert_eq!(m3.len(), client_conf.mtu);
        let (m4, _server_peer) = server_hs.server_recv_m3(&m3).unwrap();
        assert_eq!(m4.len(), server_conf.mtu);
        let _client_peer = client_hs.client_recv_m4(&m4).unwrap();
    }

    #[test]
    fn tampered_m3_signature_is_rejected() {
        let (client_conf, server_conf) = client_server_confs();
        let mut rng = OsRng;

        let (mut client_hs, m1) = Handshake::client_m1(&client_conf, &mut rng).unwrap();
        let (mut server_hs, m2) = Handshake::server_recv_m1(&server_conf, &m1, &mut rng).unwrap();
        let mut m3 = client_hs.client_recv_m2(&m2, &mut rng).unwrap();
        let last = m3.len() - 1;
        m3[last] ^= 0xff;

        assert!(server_hs.server_recv_m3(&m3).is_err());
    }

    #[test]
    fn mismatched_r_server_echo_is_rejected() {
        let (client_conf, server_conf) = client_server_confs();
        let mut rng = OsRng;

        let (mut client_hs, m1) = Handshake::client_m1(&client_conf, &mut rng).unwrap();
        let (mut server_hs, _m2) = Handshake::server_recv_m1(&server_conf, &m1, &mut rng).unwrap();
        // Forge a second, independent server handshake so the client's M3
        // echoes an r_server the real server never issued.
        let (mut other_server_hs, other_m2) =
            Handshake::server_recv_m1(&server_conf, &m1, &mut rng).unwrap();
        let _ = &mut other_server_hs;
        let m3 = client_hs.client_recv_m2(&other_m2, &mut rng).unwrap();

        assert!(server_hs.server_recv_m3(&m3).is_err());
    }
}
