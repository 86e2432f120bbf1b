//! # Identity Keys
//!
//! A node's long-term identity keypair. The secret half never leaves this
//! type except through [`IdentityKeypair::to_key_file`], which the node
//! binary uses once at `keygen` time.
//!
//! Key bytes are never logged. `Debug` prints the algorithm and peer id only.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use pqcrypto_mldsa::mldsa44;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::hash::identity_digest;
use super::signatures::{SignatureAlg, SignatureError};
use crate::types::PeerId;

/// Long-term identity keypair for one of the supported schemes.
pub enum IdentityKeypair {
    Ed25519(SigningKey),
    MlDsa44 {
        public: Vec<u8>,
        secret: Zeroizing<Vec<u8>>,
    },
}

/// On-disk representation written by `tessera-node keygen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub alg: SignatureAlg,
    /// Hex-encoded public key.
    pub public_key: String,
    /// Hex-encoded secret key.
    pub secret_key: String,
}

impl IdentityKeypair {
    /// Fresh keypair from the OS RNG.
    pub fn generate(alg: SignatureAlg) -> Self {
        match alg {
            SignatureAlg::Ed25519 => Self::Ed25519(SigningKey::generate(&mut OsRng)),
            SignatureAlg::MlDsa44 => {
                let (pk, sk) = mldsa44::keypair();
                Self::MlDsa44 {
                    public: pk.as_bytes().to_vec(),
                    secret: Zeroizing::new(sk.as_bytes().to_vec()),
                }
            }
        }
    }

    /// Deterministic Ed25519 identity. Test fixtures and reproducible devnets.
    pub fn ed25519_from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::Ed25519(SigningKey::from_bytes(seed))
    }

    pub fn alg(&self) -> SignatureAlg {
        match self {
            Self::Ed25519(_) => SignatureAlg::Ed25519,
            Self::MlDsa44 { .. } => SignatureAlg::MlDsa44,
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(sk) => sk.verifying_key().to_bytes().to_vec(),
            Self::MlDsa44 { public, .. } => public.clone(),
        }
    }

    /// The identity digest peers will know us by.
    pub fn peer_id(&self) -> PeerId {
        identity_digest(&self.public_key(), self.alg())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Ed25519(sk) => sk.sign(message).to_bytes().to_vec(),
            Self::MlDsa44 { secret, .. } => match mldsa44::SecretKey::from_bytes(secret) {
                Ok(sk) => mldsa44::detached_sign(message, &sk).as_bytes().to_vec(),
                // Only reachable if the stored bytes were corrupted after
                // construction; an empty signature then fails verification.
                Err(_) => Vec::new(),
            },
        }
    }

    pub fn to_key_file(&self) -> KeyFile {
        let secret_key = match self {
            Self::Ed25519(sk) => hex::encode(sk.to_bytes()),
            Self::MlDsa44 { secret, .. } => hex::encode(secret.as_slice()),
        };
        KeyFile {
            alg: self.alg(),
            public_key: hex::encode(self.public_key()),
            secret_key,
        }
    }

    pub fn from_key_file(file: &KeyFile) -> Result<Self, SignatureError> {
        let secret = Zeroizing::new(
            hex::decode(&file.secret_key)
                .map_err(|_| SignatureError::InvalidSecretKey(file.alg.name()))?,
        );
        let public = hex::decode(&file.public_key)
            .map_err(|_| SignatureError::InvalidPublicKey(file.alg.name()))?;

        let kp = match file.alg {
            SignatureAlg::Ed25519 => {
                let bytes: [u8; SECRET_KEY_LENGTH] = secret
                    .as_slice()
                    .try_into()
                    .map_err(|_| SignatureError::InvalidSecretKey(file.alg.name()))?;
                Self::Ed25519(SigningKey::from_bytes(&bytes))
            }
            SignatureAlg::MlDsa44 => {
                mldsa44::SecretKey::from_bytes(&secret)
                    .map_err(|_| SignatureError::InvalidSecretKey(file.alg.name()))?;
                mldsa44::PublicKey::from_bytes(&public)
                    .map_err(|_| SignatureError::InvalidPublicKey(file.alg.name()))?;
                Self::MlDsa44 {
                    public: public.clone(),
                    secret,
                }
            }
        };

        if kp.public_key() != public {
            return Err(SignatureError::InvalidPublicKey(file.alg.name()));
        }
        Ok(kp)
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("alg", &self.alg())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signatures::verify;

    #[test]
    fn seeded_ed25519_is_deterministic() {
        let a = IdentityKeypair::ed25519_from_seed(&[9u8; 32]);
        let b = IdentityKeypair::ed25519_from_seed(&[9u8; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn key_file_roundtrip_ed25519() {
        let kp = IdentityKeypair::generate(SignatureAlg::Ed25519);
        let back = IdentityKeypair::from_key_file(&kp.to_key_file()).unwrap();
        assert_eq!(back.peer_id(), kp.peer_id());
        let sig = back.sign(b"hello");
        assert!(verify(SignatureAlg::Ed25519, &kp.public_key(), b"hello", &sig).is_ok());
    }

    #[test]
    fn key_file_roundtrip_mldsa() {
        let kp = IdentityKeypair::generate(SignatureAlg::MlDsa44);
        let back = IdentityKeypair::from_key_file(&kp.to_key_file()).unwrap();
        assert_eq!(back.peer_id(), kp.peer_id());
    }

    #[test]
    fn key_file_with_mismatched_public_key_is_rejected() {
        let kp = IdentityKeypair::generate(SignatureAlg::Ed25519);
        let other = IdentityKeypair::generate(SignatureAlg::Ed25519);
        let mut file = kp.to_key_file();
        file.public_key = hex::encode(other.public_key());
        assert!(IdentityKeypair::from_key_file(&file).is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = IdentityKeypair::ed25519_from_seed(&[1u8; 32]);
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&hex::encode([1u8; 32])));
        assert!(dbg.contains("ed25519") || dbg.contains("Ed25519"));
    }
}
