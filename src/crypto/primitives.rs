//! Thin wrappers around the RustCrypto primitives the engine depends on:
//! Salsa20/XSalsa20 (stream cipher), Poly1305 (one-time MAC), BLAKE2b-256
//! (hash), and Ed25519 (signatures, via the already-present teacher
//! dependency). Curve25519 DH and the Elligator2 representative live in
//! `crypto::elligator`; XTEA lives in `crypto::xtea`.

use blake2::Digest;
use cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Key as Poly1305Key, Poly1305};
use salsa20::{Salsa20, XSalsa20};

pub const SESSION_KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

type Blake2b256 = blake2::Blake2b<digest::consts::U32>;

/// BLAKE2b-256 over a single buffer.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE2b-256 over several buffers concatenated, without materializing
/// the concatenation.
pub fn blake2b_256_many(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Salsa20 keystream XOR, 8-byte nonce, 32-byte key.
pub fn salsa20_xor(key: &[u8; 32], nonce: &[u8; 8], data: &mut [u8]) {
    let mut cipher = Salsa20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// XSalsa20 keystream XOR, 24-byte (extended) nonce, 32-byte key. Used
/// only by the chaffing-and-winnowing codec.
pub fn xsalsa20_xor(key: &[u8; 32], nonce: &[u8; 24], data: &mut [u8]) {
    let mut cipher = XSalsa20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// Produces `count` bytes of raw Salsa20 keystream (used to derive
/// one-time Poly1305 keys and the nonce-permutation-cipher key).
pub fn salsa20_keystream(key: &[u8; 32], nonce: &[u8; 8], count: usize) -> Vec<u8> {
    let mut buf = vec![0u8; count];
    salsa20_xor(key, nonce, &mut buf);
    buf
}

pub fn poly1305_tag(key: &[u8; 32], data: &[u8]) -> [u8; TAG_SIZE] {
    let key = Poly1305Key::from_slice(key);
    let mut mac = Poly1305::new(key);
    mac.update_padded(data);
    mac.finalize().into()
}

pub fn poly1305_verify(key: &[u8; 32], data: &[u8], tag: &[u8; TAG_SIZE]) -> bool {
    let computed = poly1305_tag(key, data);
    use subtle::ConstantTimeEq;
    computed.ct_eq(tag).into()
}

/// Deterministic Ed25519 keypair generation from a 32-byte seed
/// (RFC 8032 seed expansion — compatible with the historical
/// `agl/ed25519` construction the original daemon relied on).
pub fn ed25519_from_seed(seed: &[u8; 32]) -> SigningKey {
    SigningKey::from_bytes(seed)
}

pub fn ed25519_sign(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn ed25519_verify(verifying_key: &VerifyingKey, message: &[u8], sig: &Signature) -> bool {
    verifying_key.verify(message, sig).is_ok()
}
