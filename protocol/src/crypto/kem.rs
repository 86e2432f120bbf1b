//! # Ephemeral KEM
//!
//! Kyber-768 key encapsulation for the handshake. Each side generates a fresh
//! ephemeral keypair per connection, and each side encapsulates to the
//! other's public key, so the session depends on two independent shared
//! secrets.
//!
//! The ephemeral secret is single-use: [`EphemeralKem::decapsulate`] takes it
//! out of the struct, and a second call is an error.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use thiserror::Error;
use zeroize::Zeroizing;

/// Kyber-768 public key length.
pub fn public_key_len() -> usize {
    kyber768::public_key_bytes()
}

/// Kyber-768 ciphertext length.
pub fn ciphertext_len() -> usize {
    kyber768::ciphertext_bytes()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KemError {
    #[error("invalid KEM public key ({0} bytes)")]
    InvalidPublicKey(usize),

    #[error("invalid KEM ciphertext ({0} bytes)")]
    InvalidCiphertext(usize),

    #[error("ephemeral KEM secret already consumed")]
    SecretConsumed,
}

/// A shared secret, wiped on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// One side's ephemeral KEM keypair.
pub struct EphemeralKem {
    public: Vec<u8>,
    secret: Option<kyber768::SecretKey>,
}

impl EphemeralKem {
    pub fn generate() -> Self {
        let (pk, sk) = kyber768::keypair();
        Self {
            public: pk.as_bytes().to_vec(),
            secret: Some(sk),
        }
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Recover the secret the peer encapsulated to us. Consumes the secret.
    ///
    /// Kyber uses implicit rejection: a tampered (but well-sized) ciphertext
    /// decapsulates to an unrelated secret instead of failing. The handshake
    /// catches that through key confirmation.
    pub fn decapsulate(&mut self, ciphertext: &[u8]) -> Result<SharedSecret, KemError> {
        let ct = kyber768::Ciphertext::from_bytes(ciphertext)
            .map_err(|_| KemError::InvalidCiphertext(ciphertext.len()))?;
        let sk = self.secret.take().ok_or(KemError::SecretConsumed)?;
        let ss = kyber768::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

/// Encapsulate a fresh secret to `peer_public`. Returns `(secret, ciphertext)`.
pub fn encapsulate(peer_public: &[u8]) -> Result<(SharedSecret, Vec<u8>), KemError> {
    let pk = kyber768::PublicKey::from_bytes(peer_public)
        .map_err(|_| KemError::InvalidPublicKey(peer_public.len()))?;
    let (ss, ct) = kyber768::encapsulate(&pk);
    Ok((Zeroizing::new(ss.as_bytes().to_vec()), ct.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_decapsulate_agree() {
        let mut bob = EphemeralKem::generate();
        let (ss_alice, ct) = encapsulate(bob.public_key()).unwrap();
        let ss_bob = bob.decapsulate(&ct).unwrap();
        assert_eq!(*ss_alice, *ss_bob);
        assert_eq!(ct.len(), ciphertext_len());
    }

    #[test]
    fn secret_is_single_use() {
        let mut bob = EphemeralKem::generate();
        let (_, ct) = encapsulate(bob.public_key()).unwrap();
        assert!(bob.decapsulate(&ct).is_ok());
        assert_eq!(bob.decapsulate(&ct), Err(KemError::SecretConsumed));
    }

    #[test]
    fn tampered_ciphertext_yields_different_secret() {
        let mut bob = EphemeralKem::generate();
        let (ss_alice, mut ct) = encapsulate(bob.public_key()).unwrap();
        ct[0] ^= 0xFF;
        let ss_bob = bob.decapsulate(&ct).unwrap();
        assert_ne!(*ss_alice, *ss_bob);
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        assert_eq!(
            encapsulate(&[0u8; 12]).unwrap_err(),
            KemError::InvalidPublicKey(12)
        );
        let mut bob = EphemeralKem::generate();
        assert_eq!(
            bob.decapsulate(&[0u8; 5]).unwrap_err(),
            KemError::InvalidCiphertext(5)
        );
    }
}
