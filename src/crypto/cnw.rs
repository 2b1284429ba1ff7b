//! Chaffing-and-winnowing codec, grounded on `cnw/cnw.go`. Each input
//! byte is blown up into 16 Poly1305 tags (two per bit: one authentic
//! under a per-bit, per-value one-time key, one chaff), so the output
//! carries no ciphertext at all — only an authenticated encoding of
//! which half of each pair is genuine.

use crate::crypto::error::{CryptoError, Result};
use crate::crypto::primitives::{poly1305_tag, xsalsa20_xor, TAG_SIZE};

/// Each input byte expands to 8 bits * 2 candidates * TAG_SIZE bytes.
pub const ENLARGE_FACTOR: usize = 16 * TAG_SIZE;

const KEYSTREAM_PER_BYTE: usize = 8 * 64; // two 32-byte MAC keys per bit

fn bit_nonce(nonce_prefix: &[u8; 8], byte_index: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..8].copy_from_slice(nonce_prefix);
    nonce[16..24].copy_from_slice(&byte_index.to_be_bytes());
    nonce
}

/// Expands `input` into `input.len() * ENLARGE_FACTOR` bytes of chaffed
/// authentication tags under `auth_key`, keyed per-byte by
/// `nonce_prefix` (the caller's 8-byte session nonce field).
pub fn chaff(auth_key: &[u8; 32], nonce_prefix: &[u8; 8], input: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; input.len() * ENLARGE_FACTOR];
    for (n, &b) in input.iter().enumerate() {
        let nonce = bit_nonce(nonce_prefix, n as u64);
        // XSalsa20 keystream doubles as an XOR mask here only to derive
        // one-time Poly1305 keys; the actual transport carries no
        // ciphertext, only tags over fixed "0"/"1" plaintexts.
        let keys = xsalsa20_keystream(auth_key, &nonce, KEYSTREAM_PER_BYTE);
        let base = n * 16 * TAG_SIZE;
        for i in 0..8 {
            let bit = (b >> i) & 1;
            let key1: [u8; 32] = keys[64 * i..64 * i + 32].try_into().unwrap();
            let key2: [u8; 32] = keys[64 * i + 32..64 * i + 64].try_into().unwrap();
            let (tag_lo, tag_hi) = if bit == 0 {
                (poly1305_tag(&key1, b"1"), poly1305_tag(&key2, b"0"))
            } else {
                (poly1305_tag(&key1, b"0"), poly1305_tag(&key2, b"1"))
            };
            let off = base + (2 * i) * TAG_SIZE;
            out[off..off + TAG_SIZE].copy_from_slice(&tag_lo);
            out[off + TAG_SIZE..off + 2 * TAG_SIZE].copy_from_slice(&tag_hi);
        }
    }
    out
}

/// Reverses `chaff`, recovering the original bytes. Fails if exactly one
/// of each tag pair does not authenticate under the derived one-time
/// keys (tampering, wrong key, or wrong nonce prefix).
pub fn winnow(auth_key: &[u8; 32], nonce_prefix: &[u8; 8], input: &[u8]) -> Result<Vec<u8>> {
    if input.len() % ENLARGE_FACTOR != 0 {
        return Err(CryptoError::BadLength);
    }
    let out_len = input.len() / ENLARGE_FACTOR;
    let mut out = vec![0u8; out_len];
    for n in 0..out_len {
        let nonce = bit_nonce(nonce_prefix, n as u64);
        let keys = xsalsa20_keystream(auth_key, &nonce, KEYSTREAM_PER_BYTE);
        let base = n * 16 * TAG_SIZE;
        let mut byte = 0u8;
        for i in 0..8 {
            let key1: [u8; 32] = keys[64 * i..64 * i + 32].try_into().unwrap();
            let key2: [u8; 32] = keys[64 * i + 32..64 * i + 64].try_into().unwrap();
            let off = base + (2 * i) * TAG_SIZE;
            let tag_lo: [u8; TAG_SIZE] = input[off..off + TAG_SIZE].try_into().unwrap();
            let tag_hi: [u8; TAG_SIZE] = input[off + TAG_SIZE..off + 2 * TAG_SIZE]
                .try_into()
                .unwrap();

            let lo_is_1 = ct_eq_tag(&poly1305_tag(&key1, b"1"), &tag_lo);
            let lo_is_0 = ct_eq_tag(&poly1305_tag(&key1, b"0"), &tag_lo);
            let hi_is_1 = ct_eq_tag(&poly1305_tag(&key2, b"1"), &tag_hi);
            let hi_is_0 = ct_eq_tag(&poly1305_tag(&key2, b"0"), &tag_hi);

            let bit_is_1 = lo_is_0 && hi_is_1;
            let bit_is_0 = lo_is_1 && hi_is_0;
            if !(bit_is_0 || bit_is_1) {
                return Err(CryptoError::BadAuth);
            }
            if bit_is_1 {
                byte |= 1 << i;
            }
        }
        out[n] = byte;
    }
    Ok(out)
}

fn ct_eq_tag(a: &[u8; TAG_SIZE], b: &[u8; TAG_SIZE]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).unwrap_u8() == 1
}

fn xsalsa20_keystream(key: &[u8; 32], nonce: &[u8; 24], count: usize) -> Vec<u8> {
    let mut buf = vec![0u8; count];
    xsalsa20_xor(key, nonce, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = [5u8; 32];
        let prefix = [1u8; 8];
        let msg = b"chaff me";
        let chaffed = chaff(&key, &prefix, msg);
        assert_eq!(chaffed.len(), msg.len() * ENLARGE_FACTOR);
        let winnowed = winnow(&key, &prefix, &chaffed).expect("must winnow cleanly");
        assert_eq!(winnowed, msg);
    }

    #[test]
    fn wrong_key_fails_to_winnow() {
        let key = [5u8; 32];
        let other = [6u8; 32];
        let prefix = [1u8; 8];
        let chaffed = chaff(&key, &prefix, b"secret");
        assert!(winnow(&other, &prefix, &chaffed).is_err());
    }

    #[test]
    fn tampered_tag_fails_to_winnow() {
        let key = [5u8; 32];
        let prefix = [2u8; 8];
        let mut chaffed = chaff(&key, &prefix, b"x");
        chaffed[0] ^= 0xff;
        assert!(winnow(&key, &prefix, &chaffed).is_err());
    }
}
