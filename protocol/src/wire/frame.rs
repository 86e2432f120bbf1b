//! # Frame Envelope
//!
//! Every message travels in a frame: a fixed 20-byte big-endian header
//! followed by `payload_len` payload bytes.
//!
//! ```text
//!  0       2               6       8                      16              20
//!  +-------+---------------+-------+-----------------------+---------------+
//!  |msg_id |      seq      | flags |        digest8        |  payload_len  |
//!  +-------+---------------+-------+-----------------------+---------------+
//! ```
//!
//! For sealed frames the payload is AEAD ciphertext including the 16-byte
//! tag, and the header bytes are the associated data. Handshake frames carry
//! the `PLAINTEXT` flag and a bare CBOR payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::messages::{ids, Message};
use super::WireError;
use crate::config::{
    AEAD_TAG_LENGTH, FRAME_HEADER_LENGTH, MAX_BLOCKS_PER_REQUEST, MAX_BLOCK_BYTES,
    MAX_FRAME_PAYLOAD, MAX_HEADERS_PER_MESSAGE, MAX_HEADER_BYTES, MAX_INV_ITEMS, MAX_TX_BYTES,
};
use crate::crypto::hash::digest8;

/// Frame flag bits.
pub mod flags {
    /// Sender has advanced its key generation with this frame.
    pub const REKEY: u16 = 0x0001;
    /// Payload is not encrypted. Only valid for handshake messages.
    pub const PLAINTEXT: u16 = 0x0002;
}

/// Largest plaintext payload accepted for a message id.
///
/// Unknown ids get the global cap so that a newer peer's messages can be
/// skipped without tearing the connection down.
pub fn max_payload_len(msg_id: u16) -> usize {
    let inv_list = MAX_INV_ITEMS * 48 + 64;
    match msg_id {
        ids::HANDSHAKE_INIT => 4 * 1024,
        ids::HANDSHAKE_REPLY => 8 * 1024,
        ids::HANDSHAKE_FINISH => 16 * 1024,
        ids::HANDSHAKE_ACCEPT => 8 * 1024,

        ids::IDENTIFY => 4 * 1024,
        ids::PING | ids::PONG => 64,
        ids::BYE => 512,

        ids::INV | ids::GET_DATA | ids::NOT_FOUND => inv_list,
        ids::DATA => MAX_BLOCK_BYTES + 64 * 1024,

        ids::GET_HEADERS => 2 * 1024,
        ids::HEADERS => MAX_HEADERS_PER_MESSAGE * MAX_HEADER_BYTES,
        ids::GET_BLOCKS => MAX_BLOCKS_PER_REQUEST * 40 + 64,
        ids::BLOCKS => MAX_FRAME_PAYLOAD,
        ids::NEW_BLOCK => MAX_HEADER_BYTES + 64,
        ids::NEW_HEAD => 128,

        ids::SUBSCRIBE | ids::UNSUBSCRIBE => 1024,
        ids::GOSSIP => MAX_TX_BYTES + 1024,
        ids::GRAFT | ids::PRUNE => 256,

        ids::CREDITS | ids::PAUSE | ids::RESUME | ids::ACK => 64,

        _ => MAX_FRAME_PAYLOAD,
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_id: u16,
    pub seq: u32,
    pub flags: u16,
    pub digest8: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LENGTH] {
        let mut out = [0u8; FRAME_HEADER_LENGTH];
        out[0..2].copy_from_slice(&self.msg_id.to_be_bytes());
        out[2..6].copy_from_slice(&self.seq.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..16].copy_from_slice(&self.digest8.to_be_bytes());
        out[16..20].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < FRAME_HEADER_LENGTH {
            return Err(WireError::TruncatedHeader(bytes.len()));
        }
        let be16 = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let be32 =
            |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let mut d8 = [0u8; 8];
        d8.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            msg_id: be16(0),
            seq: be32(2),
            flags: be16(6),
            digest8: u64::from_be_bytes(d8),
            payload_len: be32(16),
        })
    }

    pub fn is_plaintext(&self) -> bool {
        self.flags & flags::PLAINTEXT != 0
    }

    pub fn is_rekey(&self) -> bool {
        self.flags & flags::REKEY != 0
    }

    /// Largest `payload_len` this header may declare.
    pub fn max_wire_len(&self) -> usize {
        let base = max_payload_len(self.msg_id);
        if self.is_plaintext() {
            base
        } else {
            base + AEAD_TAG_LENGTH
        }
    }

    /// Per-message size gate. Runs before any buffering or decryption.
    pub fn check_size(&self) -> Result<(), WireError> {
        let max = self.max_wire_len();
        if self.payload_len as usize > max {
            return Err(WireError::Oversize {
                msg_id: self.msg_id,
                len: self.payload_len as usize,
                max,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A header plus its on-wire payload (ciphertext unless `PLAINTEXT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Plaintext frame for a handshake message.
    pub fn plaintext(message: &Message) -> Result<Self, WireError> {
        let payload = message.encode_payload()?;
        let header = FrameHeader {
            msg_id: message.msg_id(),
            seq: 0,
            flags: flags::PLAINTEXT,
            digest8: digest8(&payload),
            payload_len: payload.len() as u32,
        };
        Ok(Self {
            header,
            payload: Bytes::from(payload),
        })
    }

    /// Decode a plaintext frame, verifying the digest pre-check.
    pub fn open_plaintext(&self) -> Result<Message, WireError> {
        if !self.header.is_plaintext() {
            return Err(WireError::UnexpectedFlags(self.header.flags));
        }
        if digest8(&self.payload) != self.header.digest8 {
            return Err(WireError::DigestMismatch);
        }
        Message::decode(self.header.msg_id, &self.payload)
    }

    pub fn encode_to(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_LENGTH + self.payload.len());
        dst.put_slice(&self.header.encode());
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LENGTH + self.payload.len());
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Parse one frame from a datagram. The datagram must hold exactly one
    /// frame.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::decode(datagram)?;
        header.check_size()?;
        let body = &datagram[FRAME_HEADER_LENGTH..];
        if body.len() != header.payload_len as usize {
            return Err(WireError::LengthMismatch {
                declared: header.payload_len as usize,
                actual: body.len(),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::messages::Ping;

    #[test]
    fn header_layout_is_big_endian() {
        let h = FrameHeader {
            msg_id: 0x0102,
            seq: 0x0304_0506,
            flags: 0x0708,
            digest8: 0x090A_0B0C_0D0E_0F10,
            payload_len: 0x1112_1314,
        };
        let bytes = h.encode();
        assert_eq!(
            bytes,
            [
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
                0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14
            ]
        );
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            FrameHeader::decode(&[0u8; 19]),
            Err(WireError::TruncatedHeader(19))
        ));
    }

    #[test]
    fn sealed_frames_allow_for_the_tag() {
        let max = max_payload_len(ids::PING);
        let mut h = FrameHeader {
            msg_id: ids::PING,
            seq: 1,
            flags: 0,
            digest8: 0,
            payload_len: (max + AEAD_TAG_LENGTH) as u32,
        };
        assert!(h.check_size().is_ok());
        h.payload_len += 1;
        assert!(matches!(h.check_size(), Err(WireError::Oversize { .. })));

        h.flags = flags::PLAINTEXT;
        h.payload_len = (max + 1) as u32;
        assert!(h.check_size().is_err());
    }

    #[test]
    fn plaintext_frame_checks_digest() {
        let mut frame = Frame::plaintext(&Message::Ping(Ping { nonce: 42 })).unwrap();
        assert_eq!(
            frame.open_plaintext().unwrap(),
            Message::Ping(Ping { nonce: 42 })
        );
        frame.header.digest8 ^= 1;
        assert!(matches!(
            frame.open_plaintext(),
            Err(WireError::DigestMismatch)
        ));
    }

    #[test]
    fn datagram_must_match_declared_length() {
        let frame = Frame::plaintext(&Message::Ping(Ping { nonce: 1 })).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(Frame::from_datagram(&bytes).unwrap(), frame);

        let mut padded = bytes.to_vec();
        padded.push(0);
        assert!(matches!(
            Frame::from_datagram(&padded),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_ids_get_the_global_cap() {
        assert_eq!(max_payload_len(0x7777), MAX_FRAME_PAYLOAD);
    }
}
