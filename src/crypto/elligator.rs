//! Curve25519 scalar multiplication (delegated to `curve25519-dalek`) plus
//! the Elligator2 representative encoding, which `curve25519-dalek` does
//! not expose. No crate in the dependency corpus implements Elligator2,
//! so the representative map is implemented here directly on top of a
//! small first-party finite-field helper (mod `2^255 - 19`). Scalar
//! multiplication itself — the actual Diffie-Hellman operation — always
//! goes through `curve25519-dalek`'s `MontgomeryPoint`, never through the
//! field helper below.

use curve25519_dalek::constants::X25519_BASEPOINT;
use curve25519_dalek::montgomery::MontgomeryPoint;
use rand::RngCore;

/// p = 2^255 - 19, big-endian.
const P_BE: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xed,
];

const CURVE_A: u64 = 486662;

fn is_zero(x: &[u8; 32]) -> bool {
    x.iter().all(|&b| b == 0)
}

fn cmp_be(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

fn sub_be(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow: i32 = 0;
    for i in (0..32).rev() {
        let ai = a[i] as i32;
        let bi = b[i] as i32;
        let mut d = ai - bi - borrow;
        if d < 0 {
            d += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = d as u8;
    }
    out
}

fn add_raw(a: &[u8; 32], b: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    let mut carry: u32 = 0;
    for i in (0..32).rev() {
        let s = a[i] as u32 + b[i] as u32 + carry;
        out[i + 1] = (s & 0xff) as u8;
        carry = s >> 8;
    }
    out[0] = carry as u8;
    out
}

/// Reduces an arbitrary big-endian byte string modulo p via binary long
/// division (shift-and-subtract). Simple, not constant-time, but only
/// ever applied to public values (representatives, public keys) during
/// the handshake, never to raw scalars.
fn reduce_mod_p(wide: &[u8]) -> [u8; 32] {
    let mut rem = [0u8; 32];
    for &byte in wide {
        for bit in (0..8).rev() {
            // rem = (rem << 1) | next_bit
            let mut carry = (byte >> bit) & 1;
            for i in (0..32).rev() {
                let nb = (rem[i] << 1) | carry;
                carry = rem[i] >> 7;
                rem[i] = nb;
            }
            if cmp_be(&rem, &P_BE) != std::cmp::Ordering::Less {
                rem = sub_be(&rem, &P_BE);
            }
        }
    }
    rem
}

fn mul_full(a: &[u8; 32], b: &[u8; 32]) -> [u8; 64] {
    let mut acc = [0u64; 64];
    for i in 0..32 {
        let av = a[31 - i] as u64;
        if av == 0 {
            continue;
        }
        for j in 0..32 {
            let bv = b[31 - j] as u64;
            acc[i + j] += av * bv;
        }
    }
    // Carry propagate (little-endian byte positions 0..64).
    let mut carry: u64 = 0;
    let mut bytes_le = [0u8; 64];
    for i in 0..64 {
        let v = acc[i] + carry;
        bytes_le[i] = (v & 0xff) as u8;
        carry = v >> 8;
    }
    let mut out = [0u8; 64];
    for i in 0..64 {
        out[i] = bytes_le[63 - i];
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fe(pub [u8; 32]);

impl Fe {
    pub fn from_bytes_reduced(b: &[u8; 32]) -> Self {
        let mut wide = [0u8; 64];
        wide[32..].copy_from_slice(b);
        Fe(reduce_mod_p(&wide))
    }

    pub fn from_u64(v: u64) -> Self {
        let mut b = [0u8; 32];
        b[24..].copy_from_slice(&v.to_be_bytes());
        Fe(b)
    }

    pub fn zero() -> Self {
        Fe([0u8; 32])
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        is_zero(&self.0)
    }

    pub fn add(&self, other: &Fe) -> Fe {
        let sum = add_raw(&self.0, &other.0);
        Fe(reduce_mod_p(&sum))
    }

    pub fn sub(&self, other: &Fe) -> Fe {
        if cmp_be(&self.0, &other.0) != std::cmp::Ordering::Less {
            Fe(sub_be(&self.0, &other.0))
        } else {
            let diff = sub_be(&other.0, &self.0);
            Fe(sub_be(&P_BE, &diff))
        }
    }

    pub fn neg(&self) -> Fe {
        Fe::zero().sub(self)
    }

    pub fn mul(&self, other: &Fe) -> Fe {
        Fe(reduce_mod_p(&mul_full(&self.0, &other.0)))
    }

    pub fn square(&self) -> Fe {
        self.mul(self)
    }

    pub fn pow(&self, exp_be: &[u8; 32]) -> Fe {
        let mut result = Fe::from_u64(1);
        for byte in exp_be.iter() {
            for bit in (0..8).rev() {
                result = result.square();
                if (byte >> bit) & 1 == 1 {
                    result = result.mul(self);
                }
            }
        }
        result
    }

    /// a^(p-2) mod p, i.e. modular inverse (0 maps to 0).
    pub fn invert(&self) -> Fe {
        let mut exp = P_BE;
        exp[31] = P_BE[31].wrapping_sub(2);
        self.pow(&exp)
    }

    /// Returns a square root of `self` if one exists (p ≡ 5 mod 8 case).
    pub fn sqrt(&self) -> Option<Fe> {
        let exp_sqrt = p_plus_3_over_8();
        let mut candidate = self.pow(&exp_sqrt);
        if candidate.square() == *self {
            return Some(candidate);
        }
        candidate = candidate.mul(&sqrt_m1());
        if candidate.square() == *self {
            return Some(candidate);
        }
        None
    }
}

fn p_plus_3_over_8() -> [u8; 32] {
    // (p + 3) / 8, computed from the known prime constant rather than a
    // hand-transcribed literal.
    let mut p_plus_3 = P_BE;
    // p ends in 0xed; +3 does not carry out of the last byte.
    p_plus_3[31] = P_BE[31].wrapping_add(3);
    shr_be(&p_plus_3, 3)
}

fn p_minus_1_over_4() -> [u8; 32] {
    let mut p_minus_1 = P_BE;
    p_minus_1[31] = P_BE[31].wrapping_sub(1);
    shr_be(&p_minus_1, 2)
}

fn shr_be(bytes: &[u8; 32], n: u32) -> [u8; 32] {
    let mut out = *bytes;
    for _ in 0..n {
        let mut carry = 0u8;
        for i in 0..32 {
            let nb = (out[i] >> 1) | (carry << 7);
            carry = out[i] & 1;
            out[i] = nb;
        }
    }
    out
}

fn sqrt_m1() -> Fe {
    Fe::from_u64(2).pow(&p_minus_1_over_4())
}

/// Generates an X25519 keypair whose public key has a valid Elligator2
/// representative, retrying with fresh randomness until one is found
/// (matches the reference implementation's `dhKeypairGen` loop).
pub fn dh_keypair_gen<R: RngCore>(rng: &mut R) -> ([u8; 32], [u8; 32]) {
    loop {
        let mut priv_key = [0u8; 32];
        rng.fill_bytes(&mut priv_key);
        let pub_u = X25519_BASEPOINT.mul_clamped(priv_key).to_bytes();
        if let Some(repr) = encode_representative(&pub_u) {
            return (priv_key, repr);
        }
    }
}

/// Performs the X25519 Diffie-Hellman computation.
pub fn dh(priv_key: &[u8; 32], their_u: &[u8; 32]) -> [u8; 32] {
    MontgomeryPoint(*their_u).mul_clamped(*priv_key).to_bytes()
}

/// Elligator2 encode: given a Montgomery u-coordinate produced by
/// scalar-base multiplication, returns its representative if one exists.
/// `r = sqrt( -(A+u) / (2u) )`.
fn encode_representative(u_bytes: &[u8; 32]) -> Option<[u8; 32]> {
    let u = Fe::from_bytes_reduced(u_bytes);
    if u.is_zero() {
        return None;
    }
    let a = Fe::from_u64(CURVE_A);
    let numerator = a.add(&u).neg();
    let denominator = Fe::from_u64(2).mul(&u);
    let candidate = numerator.mul(&denominator.invert());
    candidate.sqrt().map(|r| r.to_bytes())
}

/// Elligator2 decode: representative -> Montgomery u-coordinate.
/// `u = -A / (1 + 2 r^2)`.
pub fn representative_to_public(repr: &[u8; 32]) -> [u8; 32] {
    let r = Fe::from_bytes_reduced(repr);
    let one = Fe::from_u64(1);
    let denom = one.add(&Fe::from_u64(2).mul(&r.square()));
    let a = Fe::from_u64(CURVE_A);
    a.neg().mul(&denom.invert()).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn field_add_sub_roundtrip() {
        let a = Fe::from_u64(12345);
        let b = Fe::from_u64(99999);
        let c = a.add(&b);
        assert_eq!(c.sub(&b).to_bytes(), a.to_bytes());
    }

    #[test]
    fn field_mul_inverse_identity() {
        let a = Fe::from_u64(7);
        let inv = a.invert();
        let product = a.mul(&inv);
        assert_eq!(product.to_bytes(), Fe::from_u64(1).to_bytes());
    }

    #[test]
    fn sqrt_of_square_roundtrips() {
        let a = Fe::from_u64(42);
        let sq = a.square();
        let root = sq.sqrt().expect("42^2 must be a square");
        assert_eq!(root.square().to_bytes(), sq.to_bytes());
    }

    #[test]
    fn elligator_roundtrip_when_representable() {
        let mut rng = OsRng;
        let (_priv, repr) = dh_keypair_gen(&mut rng);
        // decoding the representative must reproduce a valid curve point
        // (non-zero for an honestly generated keypair).
        let u = representative_to_public(&repr);
        assert_ne!(u, [0u8; 32]);
    }
}
