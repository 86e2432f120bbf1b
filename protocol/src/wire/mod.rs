//! # Wire Format
//!
//! Framing and payload encoding for everything a peer sends:
//!
//! - [`frame`]: the fixed 20-byte header and per-message size caps.
//! - [`messages`]: the closed message catalog, one CBOR payload type each.
//! - [`codec`]: a `tokio_util` codec that splits a byte stream into frames
//!   and discards oversize payloads without buffering them.
//! - [`objects`]: headers, bodies, transactions and shares as carried on the
//!   wire.
//!
//! Payloads are canonical CBOR via `ciborium`: struct fields in declaration
//! order, definite lengths, shortest integer forms.

pub mod codec;
pub mod frame;
pub mod messages;
pub mod objects;

pub use codec::{FrameCodec, Inbound};
pub use frame::{flags, max_payload_len, Frame, FrameHeader};
pub use messages::{ids, Message};
pub use objects::{BlobAnnouncement, BlockBody, BlockHeader, ShareEnvelope, TxEnvelope};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::error::Severity;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame header truncated ({0} bytes)")]
    TruncatedHeader(usize),

    #[error("payload of {len} bytes exceeds the {max}-byte cap for message 0x{msg_id:04x}")]
    Oversize { msg_id: u16, len: usize, max: usize },

    #[error("declared payload of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("payload length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("digest pre-check failed")]
    DigestMismatch,

    #[error("unexpected frame flags 0x{0:04x}")]
    UnexpectedFlags(u16),

    #[error("too many consecutive oversize frames ({0})")]
    OversizeRun(u32),

    #[error("unknown inventory kind {0}")]
    UnknownInvKind(u8),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("malformed payload for message 0x{msg_id:04x}: {reason}")]
    Decode { msg_id: u16, reason: String },

    #[error("payload is not canonically encoded")]
    NonCanonical,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::TruncatedHeader(_)
            | Self::FrameTooLarge(_)
            | Self::LengthMismatch { .. }
            | Self::UnexpectedFlags(_)
            | Self::OversizeRun(_)
            | Self::Io(_) => Severity::Fatal,
            Self::Oversize { .. }
            | Self::DigestMismatch
            | Self::UnknownInvKind(_)
            | Self::Encode(_)
            | Self::Decode { .. }
            | Self::NonCanonical => Severity::Soft,
        }
    }
}

/// Encode a value as canonical CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode a CBOR value. `msg_id` is only used to label the error.
pub fn from_cbor<T: DeserializeOwned>(msg_id: u16, bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode {
        msg_id,
        reason: e.to_string(),
    })
}

/// Decode and require that re-encoding reproduces the input byte for byte.
pub fn from_canonical_cbor<T: Serialize + DeserializeOwned>(
    msg_id: u16,
    bytes: &[u8],
) -> Result<T, WireError> {
    let value: T = from_cbor(msg_id, bytes)?;
    if to_cbor(&value)? != bytes {
        return Err(WireError::NonCanonical);
    }
    Ok(value)
}
