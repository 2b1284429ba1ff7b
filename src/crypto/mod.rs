//! Cryptographic primitives for the fixed, non-negotiable cipher suite:
//! Curve25519 + Elligator2 (key agreement), XTEA (identity tag and nonce
//! obfuscation), Salsa20/XSalsa20 + Poly1305 (transport), BLAKE2b-256 and
//! Ed25519 (handshake authentication), layered into an All-Or-Nothing
//! Transform, a chaffing-and-winnowing codec, and the encryptionless
//! composition of the two. No other algorithm is selectable; there is no
//! cipher-suite negotiation anywhere in this engine.

pub mod aont;
pub mod cnw;
pub mod elligator;
pub mod encless;
pub mod error;
pub mod identity;
pub mod primitives;
pub mod verifier;
pub mod xtea;

pub use error::{CryptoError, Result as CryptoResult};
