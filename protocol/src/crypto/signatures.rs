//! # Identity Signatures
//!
//! Long-term node identities sign the handshake transcript. Two schemes are
//! supported, chosen per node and announced by a one-byte algorithm id:
//!
//! - **Ed25519** (`0x01`) via `ed25519-dalek`, strict verification.
//! - **ML-DSA-44** (`0x02`) via `pqcrypto-mldsa`, detached signatures.
//!
//! Which ids a node will talk to is governed by an [`AlgorithmPolicy`]. The
//! policy also yields a 32-byte commitment (the *policy root*) that both
//! sides put in their hello; a mismatch aborts the handshake.

use ed25519_dalek::{Signature as DalekSignature, VerifyingKey};
use pqcrypto_mldsa::mldsa44;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context string for the policy root commitment.
const POLICY_ROOT_CONTEXT: &str = "tessera p2p v1 algorithm policy root";

/// Errors during signature operations.
///
/// Deliberately coarse: callers learn *that* verification failed, not why.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unsupported signature algorithm id 0x{0:02x}")]
    UnsupportedAlgorithm(u8),

    #[error("signature algorithm {0} is deprecated by local policy")]
    DeprecatedAlgorithm(&'static str),

    #[error("invalid public key for {0}")]
    InvalidPublicKey(&'static str),

    #[error("invalid secret key for {0}")]
    InvalidSecretKey(&'static str),

    #[error("signature verification failed")]
    VerificationFailed,
}

/// Signature scheme identifier as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
#[serde(try_from = "u8", into = "u8")]
pub enum SignatureAlg {
    Ed25519 = 0x01,
    MlDsa44 = 0x02,
}

impl SignatureAlg {
    pub fn from_byte(byte: u8) -> Result<Self, SignatureError> {
        match byte {
            0x01 => Ok(Self::Ed25519),
            0x02 => Ok(Self::MlDsa44),
            other => Err(SignatureError::UnsupportedAlgorithm(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::MlDsa44 => "ml-dsa-44",
        }
    }

    /// Expected public key length in bytes.
    pub fn public_key_len(self) -> usize {
        match self {
            Self::Ed25519 => ed25519_dalek::PUBLIC_KEY_LENGTH,
            Self::MlDsa44 => mldsa44::public_key_bytes(),
        }
    }

    /// Expected signature length in bytes.
    pub fn signature_len(self) -> usize {
        match self {
            Self::Ed25519 => ed25519_dalek::SIGNATURE_LENGTH,
            Self::MlDsa44 => mldsa44::signature_bytes(),
        }
    }
}

impl TryFrom<u8> for SignatureAlg {
    type Error = SignatureError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte)
    }
}

impl From<SignatureAlg> for u8 {
    fn from(alg: SignatureAlg) -> u8 {
        alg.as_byte()
    }
}

impl std::fmt::Display for SignatureAlg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which identity algorithms this node accepts from peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmPolicy {
    /// Algorithms accepted without complaint.
    pub accepted: Vec<SignatureAlg>,
    /// Algorithms still recognised but refused. Listed separately so the
    /// handshake can report "deprecated" instead of "unknown".
    pub deprecated: Vec<SignatureAlg>,
}

impl Default for AlgorithmPolicy {
    fn default() -> Self {
        Self {
            accepted: vec![SignatureAlg::Ed25519, SignatureAlg::MlDsa44],
            deprecated: Vec::new(),
        }
    }
}

impl AlgorithmPolicy {
    /// Gate an algorithm announced by a peer.
    pub fn check(&self, alg: SignatureAlg) -> Result<(), SignatureError> {
        if self.deprecated.contains(&alg) {
            return Err(SignatureError::DeprecatedAlgorithm(alg.name()));
        }
        if !self.accepted.contains(&alg) {
            return Err(SignatureError::UnsupportedAlgorithm(alg.as_byte()));
        }
        Ok(())
    }

    /// 32-byte commitment to this policy. Order-independent.
    pub fn root(&self) -> [u8; 32] {
        let mut accepted: Vec<u8> = self.accepted.iter().map(|a| a.as_byte()).collect();
        let mut deprecated: Vec<u8> = self.deprecated.iter().map(|a| a.as_byte()).collect();
        accepted.sort_unstable();
        accepted.dedup();
        deprecated.sort_unstable();
        deprecated.dedup();

        let mut hasher = blake3::Hasher::new_derive_key(POLICY_ROOT_CONTEXT);
        hasher.update(&(accepted.len() as u32).to_be_bytes());
        hasher.update(&accepted);
        hasher.update(&(deprecated.len() as u32).to_be_bytes());
        hasher.update(&deprecated);
        *hasher.finalize().as_bytes()
    }
}

/// Verify `signature` over `message` under `public_key` for `alg`.
///
/// Length checks run before any parsing so a malformed key or signature is
/// rejected without touching the scheme implementation.
pub fn verify(
    alg: SignatureAlg,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if public_key.len() != alg.public_key_len() {
        return Err(SignatureError::InvalidPublicKey(alg.name()));
    }
    if signature.len() != alg.signature_len() {
        return Err(SignatureError::VerificationFailed);
    }

    match alg {
        SignatureAlg::Ed25519 => {
            let mut pk = [0u8; ed25519_dalek::PUBLIC_KEY_LENGTH];
            pk.copy_from_slice(public_key);
            let vk = VerifyingKey::from_bytes(&pk)
                .map_err(|_| SignatureError::InvalidPublicKey(alg.name()))?;
            let sig = DalekSignature::from_slice(signature)
                .map_err(|_| SignatureError::VerificationFailed)?;
            vk.verify_strict(message, &sig)
                .map_err(|_| SignatureError::VerificationFailed)
        }
        SignatureAlg::MlDsa44 => {
            let pk = mldsa44::PublicKey::from_bytes(public_key)
                .map_err(|_| SignatureError::InvalidPublicKey(alg.name()))?;
            let sig = mldsa44::DetachedSignature::from_bytes(signature)
                .map_err(|_| SignatureError::VerificationFailed)?;
            mldsa44::verify_detached_signature(&sig, message, &pk)
                .map_err(|_| SignatureError::VerificationFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::IdentityKeypair;

    #[test]
    fn ed25519_sign_verify() {
        let kp = IdentityKeypair::generate(SignatureAlg::Ed25519);
        let sig = kp.sign(b"transcript");
        assert!(verify(SignatureAlg::Ed25519, &kp.public_key(), b"transcript", &sig).is_ok());
        assert_eq!(
            verify(SignatureAlg::Ed25519, &kp.public_key(), b"transcripT", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn mldsa_sign_verify() {
        let kp = IdentityKeypair::generate(SignatureAlg::MlDsa44);
        let sig = kp.sign(b"transcript");
        assert_eq!(sig.len(), SignatureAlg::MlDsa44.signature_len());
        assert!(verify(SignatureAlg::MlDsa44, &kp.public_key(), b"transcript", &sig).is_ok());

        let mut bad = sig.clone();
        bad[10] ^= 0x01;
        assert!(verify(SignatureAlg::MlDsa44, &kp.public_key(), b"transcript", &bad).is_err());
    }

    #[test]
    fn algorithm_mismatch_is_rejected() {
        let kp = IdentityKeypair::generate(SignatureAlg::Ed25519);
        let sig = kp.sign(b"msg");
        // Ed25519 key presented as ML-DSA: wrong length, rejected up front.
        assert!(verify(SignatureAlg::MlDsa44, &kp.public_key(), b"msg", &sig).is_err());
    }

    #[test]
    fn unknown_algorithm_byte() {
        assert_eq!(
            SignatureAlg::from_byte(0x7F),
            Err(SignatureError::UnsupportedAlgorithm(0x7F))
        );
    }

    #[test]
    fn policy_rejects_deprecated_and_unknown() {
        let policy = AlgorithmPolicy {
            accepted: vec![SignatureAlg::MlDsa44],
            deprecated: vec![SignatureAlg::Ed25519],
        };
        assert!(policy.check(SignatureAlg::MlDsa44).is_ok());
        assert_eq!(
            policy.check(SignatureAlg::Ed25519),
            Err(SignatureError::DeprecatedAlgorithm("ed25519"))
        );

        let strict = AlgorithmPolicy {
            accepted: vec![SignatureAlg::MlDsa44],
            deprecated: vec![],
        };
        assert!(matches!(
            strict.check(SignatureAlg::Ed25519),
            Err(SignatureError::UnsupportedAlgorithm(0x01))
        ));
    }

    #[test]
    fn policy_root_ignores_order_but_not_content() {
        let a = AlgorithmPolicy {
            accepted: vec![SignatureAlg::Ed25519, SignatureAlg::MlDsa44],
            deprecated: vec![],
        };
        let b = AlgorithmPolicy {
            accepted: vec![SignatureAlg::MlDsa44, SignatureAlg::Ed25519],
            deprecated: vec![],
        };
        let c = AlgorithmPolicy {
            accepted: vec![SignatureAlg::MlDsa44],
            deprecated: vec![SignatureAlg::Ed25519],
        };
        assert_eq!(a.root(), b.root());
        assert_ne!(a.root(), c.root());
    }
}
