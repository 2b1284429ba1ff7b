//! Confidentiality-preserving, encryptionless encoding: chaffing-and-
//! winnowing layered over an All-Or-Nothing-Transformed buffer, grounded
//! on `encless.go`. Only the AONT's 16-byte randomness field is chaffed
//! -- the bulk of the transformed buffer rides along unchaffed, since
//! the AONT property already makes it worthless without that field.

use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::aont;
use crate::crypto::cnw;
use crate::crypto::error::{CryptoError, Result};

pub const ENLARGE_SIZE: usize = aont::HSIZE + aont::RSIZE * cnw::ENLARGE_FACTOR;

/// Encodes `input`, consuming `aont::RSIZE` bytes of entropy from `rng`.
/// Output is `input.len() + ENLARGE_SIZE` bytes.
pub fn encode<R: RngCore>(rng: &mut R, auth_key: &[u8; 32], nonce: &[u8; 8], input: &[u8]) -> Vec<u8> {
    let mut r = [0u8; aont::RSIZE];
    rng.fill_bytes(&mut r);
    let mut aonted = aont::encode(&r, input);
    r.zeroize();

    let chaffed = cnw::chaff(auth_key, nonce, &aonted[..aont::RSIZE]);
    let mut out = chaffed;
    out.extend_from_slice(&aonted[aont::RSIZE..]);
    aonted[..aont::RSIZE].zeroize();
    out
}

/// Reverses `encode`.
pub fn decode(auth_key: &[u8; 32], nonce: &[u8; 8], input: &[u8]) -> Result<Vec<u8>> {
    let chaffed_len = aont::RSIZE * cnw::ENLARGE_FACTOR;
    if input.len() < chaffed_len {
        return Err(CryptoError::BadLength);
    }
    let mut winnowed = cnw::winnow(auth_key, nonce, &input[..chaffed_len])?;
    winnowed.extend_from_slice(&input[chaffed_len..]);
    let out = aont::decode(&winnowed);
    winnowed.zeroize();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn round_trips() {
        let mut rng = OsRng;
        let auth_key = [11u8; 32];
        let nonce = [0u8; 8];
        let msg = b"constant packet rate traffic shaping";
        let encoded = encode(&mut rng, &auth_key, &nonce, msg);
        assert_eq!(encoded.len(), msg.len() + ENLARGE_SIZE);
        let decoded = decode(&auth_key, &nonce, &encoded).expect("must decode cleanly");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn short_input_fails_cleanly_instead_of_panicking() {
        let auth_key = [11u8; 32];
        assert!(decode(&auth_key, &[0u8; 8], &[0u8; 4]).is_err());
    }

    #[test]
    fn wrong_nonce_fails_to_decode() {
        let mut rng = OsRng;
        let auth_key = [11u8; 32];
        let encoded = encode(&mut rng, &auth_key, &[0u8; 8], b"hello");
        assert!(decode(&auth_key, &[1u8; 8], &encoded).is_err());
    }
}
