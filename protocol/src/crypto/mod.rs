//! # Cryptographic Primitives
//!
//! Thin, typed wrappers over audited implementations. Nothing here invents
//! cryptography; it picks parameters, separates domains, and converts errors.
//!
//! - **Kyber-768** ephemeral KEM for the handshake (`kem`).
//! - **Ed25519 / ML-DSA-44** identity signatures (`keys`, `signatures`).
//! - **AES-256-GCM / ChaCha20-Poly1305** for traffic (`encryption`).
//! - **BLAKE3** for every hash, KDF and tag (`hash`).

pub mod encryption;
pub mod hash;
pub mod kem;
pub mod keys;
pub mod signatures;

pub use encryption::{AeadAlg, AeadCipher, AeadError};
pub use hash::{blake3_hash, content_id, digest8, identity_digest, keyed_tag};
pub use kem::{EphemeralKem, KemError};
pub use keys::{IdentityKeypair, KeyFile};
pub use signatures::{verify, AlgorithmPolicy, SignatureAlg, SignatureError};

use thiserror::Error;

use crate::error::Severity;

/// Any primitive failure, for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Kem(#[from] KemError),

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

impl CryptoError {
    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}
