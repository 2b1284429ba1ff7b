//! Typed cryptographic error kinds, named after the abstract kinds the
//! session engine is specified against.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed structure")]
    BadStructure,
    #[error("invalid parameters")]
    BadParams,
    #[error("invalid base64 encoding")]
    BadBase64,
    #[error("invalid length")]
    BadLength,
    #[error("authentication failed")]
    BadAuth,
    #[error("replay or unexpected nonce")]
    BadNonce,
    #[error("invalid padding")]
    BadPad,
    #[error("signature verification failed")]
    BadSignature,
    #[error("random source failure")]
    BadRandom,
    #[error("operation timed out")]
    Timeout,
    #[error("value exceeds maximum (MTU or byte budget)")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
