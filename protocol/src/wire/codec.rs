//! Stream framing for `tokio_util::codec::Framed`.
//!
//! The decoder reads the 20-byte header first and applies the per-message
//! size cap before it buffers a single payload byte. An oversize frame is
//! reported as [`Inbound::Oversize`] and its payload is skipped as it
//! arrives, so a hostile peer cannot make us hold more than one read buffer
//! of junk. A run of oversize frames, or a header declaring more than the
//! global frame limit, is a decode error and ends the stream.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::frame::{Frame, FrameHeader};
use super::WireError;
use crate::config::{AEAD_TAG_LENGTH, FRAME_HEADER_LENGTH, MAX_FRAME_PAYLOAD, MAX_OVERSIZE_FRAMES};

/// One decoded item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// Header of a frame whose payload exceeded its cap. The payload has
    /// been (or is being) discarded.
    Oversize(FrameHeader),
}

#[derive(Debug)]
pub struct FrameCodec {
    /// Payload bytes still to skip from the last oversize frame.
    skip: usize,
    oversize_run: u32,
    max_oversize_run: u32,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            skip: 0,
            oversize_run: 0,
            max_oversize_run: MAX_OVERSIZE_FRAMES,
        }
    }

    pub fn with_max_oversize_run(max: u32) -> Self {
        Self {
            max_oversize_run: max,
            ..Self::new()
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, WireError> {
        if self.skip > 0 {
            let n = self.skip.min(src.len());
            src.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(None);
            }
        }

        if src.len() < FRAME_HEADER_LENGTH {
            src.reserve(FRAME_HEADER_LENGTH - src.len());
            return Ok(None);
        }

        let header = FrameHeader::decode(&src[..FRAME_HEADER_LENGTH])?;
        let len = header.payload_len as usize;
        if len > MAX_FRAME_PAYLOAD + AEAD_TAG_LENGTH {
            return Err(WireError::FrameTooLarge(len));
        }

        if header.check_size().is_err() {
            self.oversize_run += 1;
            if self.oversize_run >= self.max_oversize_run {
                return Err(WireError::OversizeRun(self.oversize_run));
            }
            trace!(msg_id = header.msg_id, len, "skipping oversize frame");
            src.advance(FRAME_HEADER_LENGTH);
            let n = len.min(src.len());
            src.advance(n);
            self.skip = len - n;
            return Ok(Some(Inbound::Oversize(header)));
        }

        let total = FRAME_HEADER_LENGTH + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LENGTH);
        let payload = src.split_to(len).freeze();
        self.oversize_run = 0;
        Ok(Some(Inbound::Frame(Frame { header, payload })))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        if frame.payload.len() != frame.header.payload_len as usize {
            return Err(WireError::LengthMismatch {
                declared: frame.header.payload_len as usize,
                actual: frame.payload.len(),
            });
        }
        frame.encode_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::{flags, max_payload_len};
    use crate::wire::messages::{ids, Message, Ping};
    use bytes::Bytes;

    fn ping_frame(nonce: u64) -> Frame {
        Frame::plaintext(&Message::Ping(Ping { nonce })).unwrap()
    }

    fn oversize_ping_bytes() -> Vec<u8> {
        let len = max_payload_len(ids::PING) + 1;
        let header = FrameHeader {
            msg_id: ids::PING,
            seq: 0,
            flags: flags::PLAINTEXT,
            digest8: 0,
            payload_len: len as u32,
        };
        let mut out = header.encode().to_vec();
        out.extend(std::iter::repeat(0xEE).take(len));
        out
    }

    #[test]
    fn decodes_across_partial_reads() {
        let bytes = ping_frame(9).to_bytes();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[7..25]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[25..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Frame(f)) => assert_eq!(f, ping_frame(9)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_is_skipped_and_stream_resyncs() {
        let mut codec = FrameCodec::new();
        let junk = oversize_ping_bytes();
        let good = ping_frame(1).to_bytes();

        // Deliver the oversize header with only part of its payload.
        let mut buf = BytesMut::from(&junk[..FRAME_HEADER_LENGTH + 10]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Oversize(h)) if h.msg_id == ids::PING
        ));

        buf.extend_from_slice(&junk[FRAME_HEADER_LENGTH + 10..]);
        buf.extend_from_slice(&good);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Frame(f)) => assert_eq!(f.payload, ping_frame(1).payload),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oversize_run_is_fatal() {
        let mut codec = FrameCodec::with_max_oversize_run(3);
        let mut buf = BytesMut::new();
        for _ in 0..3 {
            buf.extend_from_slice(&oversize_ping_bytes());
        }
        assert!(matches!(codec.decode(&mut buf), Ok(Some(Inbound::Oversize(_)))));
        assert!(matches!(codec.decode(&mut buf), Ok(Some(Inbound::Oversize(_)))));
        assert!(matches!(codec.decode(&mut buf), Err(WireError::OversizeRun(3))));
    }

    #[test]
    fn good_frame_resets_oversize_run() {
        let mut codec = FrameCodec::with_max_oversize_run(2);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&oversize_ping_bytes());
        buf.extend_from_slice(&ping_frame(2).to_bytes());
        buf.extend_from_slice(&oversize_ping_bytes());
        assert!(matches!(codec.decode(&mut buf), Ok(Some(Inbound::Oversize(_)))));
        assert!(matches!(codec.decode(&mut buf), Ok(Some(Inbound::Frame(_)))));
        assert!(matches!(codec.decode(&mut buf), Ok(Some(Inbound::Oversize(_)))));
    }

    #[test]
    fn absurd_length_is_rejected_outright() {
        let header = FrameHeader {
            msg_id: 0x7777,
            seq: 0,
            flags: 0,
            digest8: 0,
            payload_len: u32::MAX,
        };
        let mut buf = BytesMut::from(&header.encode()[..]);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn encoder_refuses_inconsistent_frames() {
        let mut frame = ping_frame(3);
        frame.payload = Bytes::from_static(b"short");
        let mut dst = BytesMut::new();
        assert!(FrameCodec::new().encode(frame, &mut dst).is_err());
    }
}
