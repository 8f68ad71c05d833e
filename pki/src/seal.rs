//! Encryption of the CA material at rest.
//!
//! AES-256-GCM under a key derived from the operator master key with
//! PBKDF2-HMAC-SHA256. Salt and nonce are generated per seal and travel
//! inside the bundle; the master key itself is never persisted.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::{PkiError, Result};

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// The persisted form of the CA pair. Hex fields keep the blob printable so
/// it can live in a TEXT column.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SealedBundle {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

pub(crate) fn seal(cert_pem: &str, key_pem: &str, master_key: &str) -> Result<SealedBundle> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| PkiError::Seal)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| PkiError::Seal)?;

    let key = derive_key(master_key, &salt);
    let aead = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &key).map_err(|_| PkiError::Seal)?);

    let payload = serde_json::to_vec(&(cert_pem, key_pem)).map_err(|_| PkiError::Seal)?;
    let mut in_out = payload;
    aead.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| PkiError::Seal)?;

    Ok(SealedBundle {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce_bytes),
        ciphertext: hex::encode(in_out),
    })
}

pub(crate) fn open(sealed: &SealedBundle, master_key: &str) -> Result<(String, String)> {
    let salt = hex::decode(&sealed.salt).map_err(|_| PkiError::Open)?;
    let nonce_bytes: [u8; NONCE_LEN] = hex::decode(&sealed.nonce)
        .map_err(|_| PkiError::Open)?
        .try_into()
        .map_err(|_| PkiError::Open)?;
    let mut in_out = hex::decode(&sealed.ciphertext).map_err(|_| PkiError::Open)?;

    let key = derive_key(master_key, &salt);
    let aead = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &key).map_err(|_| PkiError::Open)?);

    let plaintext = aead
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| PkiError::Open)?;

    serde_json::from_slice(plaintext).map_err(|_| PkiError::Open)
}

fn derive_key(master_key: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
        salt,
        master_key.as_bytes(),
        &mut key,
    );
    key
}

#[cfg(test)]
mod tests {
    use super::{open, seal};

    #[test]
    fn round_trip() {
        let sealed = seal("CERT", "KEY", "master").unwrap();
        let (cert, key) = open(&sealed, "master").unwrap();
        assert_eq!(cert, "CERT");
        assert_eq!(key, "KEY");
    }

    #[test]
    fn blobs_differ_per_seal() {
        let a = seal("CERT", "KEY", "master").unwrap();
        let b = seal("CERT", "KEY", "master").unwrap();
        // Fresh salt and nonce every time, so identical plaintext never
        // produces an identical blob.
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut sealed = seal("CERT", "KEY", "master").unwrap();
        let mut raw = hex::decode(&sealed.ciphertext).unwrap();
        raw[0] ^= 0xff;
        sealed.ciphertext = hex::encode(raw);

        assert!(open(&sealed, "master").is_err());
    }
}
