//! Passphrase verifier: derives an Ed25519 keypair from a password via
//! Argon2d, and parses/serializes the `$argon2d$m=..,t=..,p=..$salt$pub`
//! string form peers exchange out of band. Grounded on `verifier.go`.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use zeroize::Zeroize;

use crate::crypto::error::{CryptoError, Result};
use crate::crypto::identity::{PeerId, ID_SIZE};
use crate::crypto::primitives::ed25519_from_seed;

pub const DEFAULT_M: u32 = 1 << 12;
pub const DEFAULT_T: u32 = 1 << 7;
pub const DEFAULT_P: u32 = 1;

#[derive(Debug, Clone)]
pub struct Verifier {
    pub m: u32,
    pub t: u32,
    pub p: u32,
    pub id: PeerId,
    pub public: Option<VerifyingKey>,
}

impl Verifier {
    pub fn new(m: u32, t: u32, p: u32, id: PeerId) -> Self {
        Self {
            m,
            t,
            p,
            id,
            public: None,
        }
    }

    /// Derives the Ed25519 keypair from `password`, stores the public
    /// half on the verifier, and returns the signing key.
    pub fn password_apply(&mut self, password: &str) -> Result<SigningKey> {
        let params = Params::new(self.m, self.t, self.p, Some(SECRET_KEY_LENGTH))
            .map_err(|_| CryptoError::BadParams)?;
        let argon2 = Argon2::new(Algorithm::Argon2d, Version::V0x13, params);
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        argon2
            .hash_password_into(password.as_bytes(), &self.id.0, &mut seed)
            .map_err(|_| CryptoError::BadParams)?;
        let signing_key = ed25519_from_seed(&seed);
        seed.zeroize();
        self.public = Some(signing_key.verifying_key());
        Ok(signing_key)
    }

    /// Short form, client-side: `$argon2d$m=..,t=..,p=..$<id>`.
    pub fn short_form(&self) -> String {
        format!(
            "$argon2d$m={},t={},p={}${}",
            self.m,
            self.t,
            self.p,
            STANDARD_NO_PAD.encode(self.id.0),
        )
    }

    /// Long form, server-side: short form plus the public key.
    pub fn long_form(&self) -> Result<String> {
        let pub_bytes = self.public.ok_or(CryptoError::BadParams)?.to_bytes();
        Ok(format!(
            "{}${}",
            self.short_form(),
            STANDARD_NO_PAD.encode(pub_bytes)
        ))
    }

    /// Parses either form.
    pub fn from_string(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split('$').collect();
        if parts.len() < 4 || parts[1] != "argon2d" {
            return Err(CryptoError::BadStructure);
        }
        let (m, t, p) = parse_params(parts[2])?;
        let salt = STANDARD_NO_PAD
            .decode(parts[3])
            .map_err(|_| CryptoError::BadBase64)?;
        if salt.len() != ID_SIZE {
            return Err(CryptoError::BadLength);
        }
        let mut id_bytes = [0u8; ID_SIZE];
        id_bytes.copy_from_slice(&salt);

        let public = if parts.len() == 5 {
            let pub_bytes = STANDARD_NO_PAD
                .decode(parts[4])
                .map_err(|_| CryptoError::BadBase64)?;
            Some(VerifyingKey::try_from(pub_bytes.as_slice()).map_err(|_| CryptoError::BadLength)?)
        } else {
            None
        };

        Ok(Self {
            m,
            t,
            p,
            id: PeerId(id_bytes),
            public,
        })
    }
}

fn parse_params(s: &str) -> Result<(u32, u32, u32)> {
    let mut m = None;
    let mut t = None;
    let mut p = None;
    for field in s.split(',') {
        let (key, value) = field.split_once('=').ok_or(CryptoError::BadStructure)?;
        let value: u32 = value.parse().map_err(|_| CryptoError::BadParams)?;
        match key {
            "m" => m = Some(value),
            "t" => t = Some(value),
            "p" => p = Some(value),
            _ => return Err(CryptoError::BadStructure),
        }
    }
    match (m, t, p) {
        (Some(m), Some(t), Some(p)) => Ok((m, t, p)),
        _ => Err(CryptoError::BadStructure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_long_form() {
        let mut v = Verifier::new(DEFAULT_M, DEFAULT_T, DEFAULT_P, PeerId([7u8; ID_SIZE]));
        v.password_apply("correct horse battery staple").unwrap();
        let long = v.long_form().unwrap();
        let parsed = Verifier::from_string(&long).unwrap();
        assert_eq!(parsed.id, v.id);
        assert_eq!(parsed.public, v.public);
    }

    #[test]
    fn short_form_omits_public_key() {
        let mut v = Verifier::new(DEFAULT_M, DEFAULT_T, DEFAULT_P, PeerId([1u8; ID_SIZE]));
        v.password_apply("hunter2").unwrap();
        let parsed = Verifier::from_string(&v.short_form()).unwrap();
        assert!(parsed.public.is_none());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Verifier::from_string("not-a-verifier").is_err());
        assert!(Verifier::from_string("$argon2d$bad$salt").is_err());
    }
}
