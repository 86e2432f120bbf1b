//! Handshake failures. Every one of them aborts the handshake; there is no
//! partial session.

use thiserror::Error;

use crate::crypto::{KemError, SignatureError};
use crate::error::Severity;
use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u16, theirs: u16 },

    #[error("chain id mismatch: ours {ours:#x}, theirs {theirs:#x}")]
    ChainMismatch { ours: u64, theirs: u64 },

    #[error("algorithm policy root mismatch")]
    PolicyMismatch,

    #[error("no AEAD algorithm in common")]
    NoCommonAead,

    #[error("peer chose AEAD id 0x{0:02x} which we did not offer")]
    UnofferedAead(u8),

    #[error("identity digest does not match the presented public key")]
    IdentityMismatch,

    #[error("key confirmation failed")]
    KeyConfirmationFailed,

    #[error("peer presented our own identity")]
    SelfConnection,

    #[error("signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("kem: {0}")]
    Kem(#[from] KemError),

    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed during handshake")]
    Closed,

    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl HandshakeError {
    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::VersionMismatch { .. } => "version",
            Self::ChainMismatch { .. } => "chain",
            Self::PolicyMismatch => "policy",
            Self::NoCommonAead | Self::UnofferedAead(_) => "aead",
            Self::IdentityMismatch => "identity",
            Self::KeyConfirmationFailed => "confirm",
            Self::SelfConnection => "self",
            Self::Signature(SignatureError::VerificationFailed) => "signature",
            Self::Signature(_) => "algorithm",
            Self::Kem(_) => "kem",
            Self::UnexpectedMessage { .. } => "order",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Wire(_) => "wire",
        }
    }
}
