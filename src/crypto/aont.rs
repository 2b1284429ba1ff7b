//! All-Or-Nothing-Transform codec (OAEP-style two-pass construction),
//! grounded on `aont/oaep.go`. Turns an input buffer into one that can
//! only be recovered in full: flipping a single output bit destroys the
//! ability to recover any of the input.

use crate::crypto::error::{CryptoError, Result};
use crate::crypto::primitives::{blake2b_256, blake2b_256_many, salsa20_xor};

pub const HSIZE: usize = 32;
pub const RSIZE: usize = 16;

const DUMMY_NONCE: [u8; 8] = [0u8; 8];

fn salsa_key_from_r(r: &[u8; RSIZE]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..RSIZE].copy_from_slice(r);
    key
}

/// Encodes `input` under one-time randomness `r`. Output length is
/// `input.len() + HSIZE + RSIZE`.
pub fn encode(r: &[u8; RSIZE], input: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; input.len() + HSIZE + RSIZE];
    out[..input.len()].copy_from_slice(input);

    let checksum = blake2b_256_many(&[r, input]);
    out[input.len()..input.len() + HSIZE].copy_from_slice(&checksum);

    let salsa_key = salsa_key_from_r(r);
    salsa20_xor(&salsa_key, &DUMMY_NONCE, &mut out[..input.len() + HSIZE]);

    let p1_hash = blake2b_256(&out[..input.len() + HSIZE]);
    for i in 0..RSIZE {
        out[input.len() + HSIZE + i] = p1_hash[i] ^ r[i];
    }
    out
}

/// Decodes an AONT-encoded buffer, returning the original input.
/// Fails if the embedded checksum does not match, which happens for any
/// corrupted or truncated input.
pub fn decode(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < HSIZE + RSIZE {
        return Err(CryptoError::BadLength);
    }
    let p1_len = input.len() - RSIZE;
    let h_p1 = blake2b_256(&input[..p1_len]);

    let mut salsa_key = [0u8; 32];
    for i in 0..RSIZE {
        salsa_key[i] = h_p1[i] ^ input[p1_len + i];
    }

    let mut out = input[..p1_len].to_vec();
    salsa20_xor(&salsa_key, &DUMMY_NONCE, &mut out);

    let m_len = out.len() - HSIZE;
    let recomputed = blake2b_256_many(&[&salsa_key[..RSIZE], &out[..m_len]]);

    use subtle::ConstantTimeEq;
    if recomputed.ct_eq(&out[m_len..]).unwrap_u8() != 1 {
        return Err(CryptoError::BadAuth);
    }
    out.truncate(m_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let r = [9u8; RSIZE];
        let msg = b"the quick brown fox jumps over the lazy dog";
        let encoded = encode(&r, msg);
        assert_eq!(encoded.len(), msg.len() + HSIZE + RSIZE);
        let decoded = decode(&encoded).expect("valid AONT buffer must decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(decode(&[0u8; HSIZE + RSIZE - 1]).is_err());
    }

    #[test]
    fn single_bit_flip_breaks_recovery() {
        let r = [3u8; RSIZE];
        let msg = b"all or nothing";
        let mut encoded = encode(&r, msg);
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert!(decode(&encoded).is_err());
    }
}
