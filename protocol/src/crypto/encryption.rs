//! # AEAD Ciphers
//!
//! The two AEADs a session may negotiate:
//!
//! - **AES-256-GCM** (`0x01`), the default. AES-NI makes it effectively free
//!   on servers.
//! - **ChaCha20-Poly1305** (`0x02`), for hosts without AES acceleration.
//!
//! Unlike a one-shot `encrypt()` with a random nonce, the session layer owns
//! nonce construction (counter XOR base nonce), so this module takes the
//! nonce as an argument and never generates one. Callers are responsible for
//! never repeating a (key, nonce) pair.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AEAD_KEY_LENGTH, AEAD_NONCE_LENGTH};

/// Kept vague on purpose: wrong key, wrong nonce, wrong AAD and corrupted
/// ciphertext all look the same from outside.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("unsupported AEAD id 0x{0:02x}")]
    UnsupportedAlgorithm(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
#[serde(try_from = "u8", into = "u8")]
pub enum AeadAlg {
    #[default]
    Aes256Gcm = 0x01,
    ChaCha20Poly1305 = 0x02,
}

impl AeadAlg {
    pub fn from_byte(byte: u8) -> Result<Self, AeadError> {
        match byte {
            0x01 => Ok(Self::Aes256Gcm),
            0x02 => Ok(Self::ChaCha20Poly1305),
            other => Err(AeadError::UnsupportedAlgorithm(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl TryFrom<u8> for AeadAlg {
    type Error = AeadError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte)
    }
}

impl From<AeadAlg> for u8 {
    fn from(alg: AeadAlg) -> u8 {
        alg as u8
    }
}

/// A keyed cipher instance. Built once per key generation, reused per frame.
pub enum AeadCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    pub fn new(alg: AeadAlg, key: &[u8; AEAD_KEY_LENGTH]) -> Result<Self, AeadError> {
        Ok(match alg {
            AeadAlg::Aes256Gcm => Self::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::EncryptFailed)?,
            )),
            AeadAlg::ChaCha20Poly1305 => Self::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::EncryptFailed)?,
            )),
        })
    }

    /// Encrypt `plaintext`, authenticating `aad`. Output includes the tag.
    pub fn seal(
        &self,
        nonce: &[u8; AEAD_NONCE_LENGTH],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            Self::Aes(c) => c.encrypt(GcmNonce::from_slice(nonce), payload),
            Self::ChaCha(c) => c.encrypt(ChaChaNonce::from_slice(nonce), payload),
        }
        .map_err(|_| AeadError::EncryptFailed)
    }

    /// Decrypt and authenticate. Any mismatch is `DecryptFailed`.
    pub fn open(
        &self,
        nonce: &[u8; AEAD_NONCE_LENGTH],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self {
            Self::Aes(c) => c.decrypt(GcmNonce::from_slice(nonce), payload),
            Self::ChaCha(c) => c.decrypt(ChaChaNonce::from_slice(nonce), payload),
        }
        .map_err(|_| AeadError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AEAD_TAG_LENGTH;

    const KEY: [u8; 32] = [0x42; 32];
    const NONCE: [u8; 12] = [0x07; 12];

    fn both() -> [AeadAlg; 2] {
        [AeadAlg::Aes256Gcm, AeadAlg::ChaCha20Poly1305]
    }

    #[test]
    fn seal_open_both_algorithms() {
        for alg in both() {
            let c = AeadCipher::new(alg, &KEY).unwrap();
            let sealed = c.seal(&NONCE, b"header", b"payload").unwrap();
            assert_eq!(sealed.len(), b"payload".len() + AEAD_TAG_LENGTH);
            assert_eq!(c.open(&NONCE, b"header", &sealed).unwrap(), b"payload");
        }
    }

    #[test]
    fn wrong_aad_fails() {
        for alg in both() {
            let c = AeadCipher::new(alg, &KEY).unwrap();
            let sealed = c.seal(&NONCE, b"header", b"payload").unwrap();
            assert_eq!(
                c.open(&NONCE, b"HEADER", &sealed),
                Err(AeadError::DecryptFailed)
            );
        }
    }

    #[test]
    fn wrong_nonce_fails() {
        let c = AeadCipher::new(AeadAlg::Aes256Gcm, &KEY).unwrap();
        let sealed = c.seal(&NONCE, b"", b"payload").unwrap();
        let mut other = NONCE;
        other[11] ^= 1;
        assert!(c.open(&other, b"", &sealed).is_err());
    }

    #[test]
    fn flipped_ciphertext_bit_fails() {
        let c = AeadCipher::new(AeadAlg::ChaCha20Poly1305, &KEY).unwrap();
        let mut sealed = c.seal(&NONCE, b"", b"payload").unwrap();
        sealed[0] ^= 0x80;
        assert!(c.open(&NONCE, b"", &sealed).is_err());
    }

    #[test]
    fn algorithm_ids() {
        assert_eq!(AeadAlg::from_byte(1).unwrap(), AeadAlg::Aes256Gcm);
        assert_eq!(AeadAlg::from_byte(2).unwrap(), AeadAlg::ChaCha20Poly1305);
        assert_eq!(
            AeadAlg::from_byte(9),
            Err(AeadError::UnsupportedAlgorithm(9))
        );
    }
}
