//! # AEAD Session
//!
//! Per-connection traffic protection after the handshake.
//!
//! ## Nonces
//!
//! Each direction has its own key and 12-byte base nonce. The nonce for a
//! frame is
//!
//! ```text
//! nonce = base XOR be32(generation) ‖ be64(seq)
//! ```
//!
//! where `generation` is the rekey generation (the stream id) and `seq` the
//! frame's wire sequence number, starting at 1. A given `(generation, seq)`
//! is used once, and the wire seq can never wrap inside a generation: the
//! sender rekeys first.
//!
//! ## Receive rules
//!
//! - The 20-byte header is the associated data.
//! - Within a generation, `seq` must strictly increase. Gaps are fine.
//! - A `REKEY` flag announces the sender moved to the next generation. We
//!   try that generation and, failing that, the adjacent one once.
//! - After decryption `digest8` must match the plaintext.
//! - Too many decrypt failures inside the window tear the connection down.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{
    AEAD_NONCE_LENGTH, AEAD_TAG_LENGTH, DECRYPT_FAILURE_BURST, DECRYPT_FAILURE_WINDOW,
    REKEY_AFTER, REKEY_AFTER_FRAMES,
};
use crate::crypto::hash::digest8;
use crate::crypto::{AeadAlg, AeadCipher, AeadError};
use crate::error::Severity;
use crate::handshake::{HandshakeOutcome, KeySchedule, Role};
use crate::sync::state::ConnState;
use crate::types::PeerId;
use crate::wire::frame::{flags, Frame, FrameHeader};
use crate::wire::{Message, WireError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rekey the send direction after this many frames.
    pub rekey_after_frames: u64,
    /// Rekey the send direction after this much time.
    pub rekey_after_ms: u64,
    /// Decrypt failures tolerated inside the window.
    pub decrypt_failure_burst: u32,
    pub decrypt_failure_window_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_after_frames: REKEY_AFTER_FRAMES,
            rekey_after_ms: REKEY_AFTER.as_millis() as u64,
            decrypt_failure_burst: DECRYPT_FAILURE_BURST,
            decrypt_failure_window_ms: DECRYPT_FAILURE_WINDOW.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("decryption failed at generation {generation}")]
    DecryptFailed { generation: u32 },

    #[error("rekey to generation {announced} could not be authenticated")]
    RekeyFailed { announced: u32 },

    #[error("replayed or reordered frame: seq {seq} <= {last}")]
    Replay { seq: u32, last: u32 },

    #[error("digest pre-check mismatch after decryption")]
    DigestMismatch,

    #[error("{0} decrypt failures inside the window")]
    FailureBurst(u32),

    #[error("plaintext frame after the handshake")]
    UnexpectedPlaintext,

    #[error("aead: {0}")]
    Aead(#[from] AeadError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl SessionError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::RekeyFailed { .. }
            | Self::FailureBurst(_)
            | Self::UnexpectedPlaintext
            | Self::Aead(_) => Severity::Fatal,
            Self::DecryptFailed { .. } | Self::Replay { .. } | Self::DigestMismatch => {
                Severity::Soft
            }
            Self::Wire(e) => e.severity(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity().is_fatal()
    }
}

/// Nonce for `(generation, seq)` under `base`.
pub fn frame_nonce(
    base: &[u8; AEAD_NONCE_LENGTH],
    generation: u32,
    seq: u64,
) -> [u8; AEAD_NONCE_LENGTH] {
    let mut counter = [0u8; AEAD_NONCE_LENGTH];
    counter[..4].copy_from_slice(&generation.to_be_bytes());
    counter[4..].copy_from_slice(&seq.to_be_bytes());
    let mut nonce = *base;
    for (n, c) in nonce.iter_mut().zip(counter.iter()) {
        *n ^= c;
    }
    nonce
}

// ---------------------------------------------------------------------------
// Direction state
// ---------------------------------------------------------------------------

struct Direction {
    keys: KeySchedule,
    cipher: AeadCipher,
    base: [u8; AEAD_NONCE_LENGTH],
    /// Last seq sent, or last seq accepted.
    seq: u32,
    frames: u64,
    since: Instant,
}

impl Direction {
    fn new(keys: KeySchedule, aead: AeadAlg, role: Role, sending: bool) -> Result<Self, AeadError> {
        let traffic = keys.traffic_keys();
        let (key, base) = if sending {
            traffic.sending(role)
        } else {
            traffic.receiving(role)
        };
        let cipher = AeadCipher::new(aead, key)?;
        let base = *base;
        Ok(Self {
            keys,
            cipher,
            base,
            seq: 0,
            frames: 0,
            since: Instant::now(),
        })
    }

    fn generation(&self) -> u32 {
        self.keys.generation()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    peer_id: PeerId,
    role: Role,
    aead: AeadAlg,
    features: u64,
    state: ConnState,
    cfg: SessionConfig,
    send: Direction,
    recv: Direction,
    announce_rekey: bool,
    failures: VecDeque<Instant>,
}

impl Session {
    pub fn new(outcome: &HandshakeOutcome, cfg: SessionConfig) -> Result<Self, SessionError> {
        let send = Direction::new(outcome.keys.clone(), outcome.aead, outcome.role, true)?;
        let recv = Direction::new(outcome.keys.clone(), outcome.aead, outcome.role, false)?;
        Ok(Self {
            peer_id: outcome.peer_id,
            role: outcome.role,
            aead: outcome.aead,
            features: outcome.features,
            state: ConnState::Authenticated,
            cfg,
            send,
            recv,
            announce_rekey: false,
            failures: VecDeque::new(),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn aead(&self) -> AeadAlg {
        self.aead
    }

    /// Feature bits both sides advertised.
    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// `(generation, last seq)` of the send direction.
    pub fn send_position(&self) -> (u32, u32) {
        (self.send.generation(), self.send.seq)
    }

    pub fn recv_position(&self) -> (u32, u32) {
        (self.recv.generation(), self.recv.seq)
    }

    /// Whether the send direction is due for a new generation.
    pub fn needs_rekey(&self) -> bool {
        self.send.seq == u32::MAX
            || self.send.frames >= self.cfg.rekey_after_frames
            || self.send.since.elapsed() >= Duration::from_millis(self.cfg.rekey_after_ms)
    }

    /// Advance the send direction. The next sealed frame carries `REKEY`.
    pub fn rekey_send(&mut self) -> Result<(), SessionError> {
        let mut keys = self.send.keys.clone();
        keys.advance();
        self.send = Direction::new(keys, self.aead, self.role, true)?;
        self.announce_rekey = true;
        debug!(peer = %self.peer_id, generation = self.send.generation(), "send direction rekeyed");
        Ok(())
    }

    /// Encrypt `message` into a frame.
    pub fn seal(&mut self, message: &Message) -> Result<Frame, SessionError> {
        if self.needs_rekey() {
            self.rekey_send()?;
        }
        let plaintext = message.encode_payload()?;
        let seq = self.send.seq + 1;
        let mut frame_flags = 0;
        if self.announce_rekey {
            frame_flags |= flags::REKEY;
        }
        let header = FrameHeader {
            msg_id: message.msg_id(),
            seq,
            flags: frame_flags,
            digest8: digest8(&plaintext),
            payload_len: (plaintext.len() + AEAD_TAG_LENGTH) as u32,
        };
        let nonce = frame_nonce(&self.send.base, self.send.generation(), seq as u64);
        let ciphertext = self.send.cipher.seal(&nonce, &header.encode(), &plaintext)?;

        self.send.seq = seq;
        self.send.frames += 1;
        self.announce_rekey = false;
        Ok(Frame {
            header,
            payload: Bytes::from(ciphertext),
        })
    }

    /// Authenticate, decrypt and decode an inbound frame.
    pub fn open(&mut self, frame: &Frame) -> Result<Message, SessionError> {
        let header = frame.header;
        if header.is_plaintext() {
            return Err(SessionError::UnexpectedPlaintext);
        }

        let current = self.recv.generation();
        let (first, second) = if header.is_rekey() {
            (current.wrapping_add(1), current)
        } else {
            (current, current.wrapping_add(1))
        };

        let aad = header.encode();
        let mut opened = None;
        for generation in [first, second] {
            if generation == current && header.seq <= self.recv.seq {
                continue;
            }
            if let Some(pt) = self.try_open(generation, &header, &aad, &frame.payload) {
                opened = Some((generation, pt));
                break;
            }
        }

        let (generation, plaintext) = match opened {
            Some(found) => found,
            None => {
                let replayed = header.is_rekey()
                    && header.seq <= self.recv.seq
                    && self
                        .try_open(current, &header, &aad, &frame.payload)
                        .is_some();
                return Err(self.classify_failure(header, current, replayed));
            }
        };

        if generation != current {
            if let Some(keys) = self.recv.keys.at_generation(generation) {
                self.recv = Direction::new(keys, self.aead, self.role, false)?;
                trace!(peer = %self.peer_id, generation, "receive direction advanced");
            }
        }
        self.recv.seq = header.seq;
        self.recv.frames += 1;

        if digest8(&plaintext) != header.digest8 {
            return Err(SessionError::DigestMismatch);
        }
        Ok(Message::decode(header.msg_id, &plaintext)?)
    }

    fn try_open(
        &self,
        generation: u32,
        header: &FrameHeader,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        if generation == self.recv.generation() {
            let nonce = frame_nonce(&self.recv.base, generation, header.seq as u64);
            return self.recv.cipher.open(&nonce, aad, ciphertext).ok();
        }
        let keys = self.recv.keys.at_generation(generation)?;
        let dir = Direction::new(keys, self.aead, self.role, false).ok()?;
        let nonce = frame_nonce(&dir.base, generation, header.seq as u64);
        dir.cipher.open(&nonce, aad, ciphertext).ok()
    }

    /// `replayed` marks a `REKEY` frame that still authenticates under the
    /// generation it already moved us to.
    fn classify_failure(
        &mut self,
        header: FrameHeader,
        current: u32,
        replayed: bool,
    ) -> SessionError {
        if header.is_rekey() && !replayed {
            return SessionError::RekeyFailed {
                announced: current.wrapping_add(1),
            };
        }
        if header.seq <= self.recv.seq {
            return SessionError::Replay {
                seq: header.seq,
                last: self.recv.seq,
            };
        }
        let now = Instant::now();
        let window = Duration::from_millis(self.cfg.decrypt_failure_window_ms);
        self.failures.push_back(now);
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        let count = self.failures.len() as u32;
        if count > self.cfg.decrypt_failure_burst {
            return SessionError::FailureBurst(count);
        }
        SessionError::DecryptFailed {
            generation: current,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("aead", &self.aead)
            .field("state", &self.state)
            .field("send", &self.send_position())
            .field("recv", &self.recv_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{HandshakeConfig, Initiator, LocalHead, Responder};
    use crate::crypto::IdentityKeypair;
    use crate::wire::messages::{Ping, TopicList};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pair_with(cfg: SessionConfig) -> (Session, Session) {
        let hs = HandshakeConfig::default();
        let a = Arc::new(IdentityKeypair::ed25519_from_seed(&[1; 32]));
        let b = Arc::new(IdentityKeypair::ed25519_from_seed(&[2; 32]));
        let (await_reply, init) = Initiator::start(&hs, a, LocalHead::default()).unwrap();
        let (await_finish, reply) = Responder::new(&hs, b, LocalHead::default())
            .on_init(init)
            .unwrap();
        let (await_accept, finish) = await_reply.on_reply(reply).unwrap();
        let (out_r, accept) = await_finish.on_finish(finish).unwrap();
        let out_i = await_accept.on_accept(accept).unwrap();
        (
            Session::new(&out_i, cfg.clone()).unwrap(),
            Session::new(&out_r, cfg).unwrap(),
        )
    }

    fn pair() -> (Session, Session) {
        pair_with(SessionConfig::default())
    }

    fn ping(n: u64) -> Message {
        Message::Ping(Ping { nonce: n })
    }

    #[test]
    fn seal_open_both_directions() {
        let (mut a, mut b) = pair();
        let f = a.seal(&ping(1)).unwrap();
        assert_eq!(f.header.seq, 1);
        assert_eq!(b.open(&f).unwrap(), ping(1));

        let back = b.seal(&Message::Subscribe(TopicList { topics: vec!["tx".into()] })).unwrap();
        assert!(matches!(a.open(&back).unwrap(), Message::Subscribe(_)));
    }

    #[test]
    fn replay_is_rejected() {
        let (mut a, mut b) = pair();
        let f = a.seal(&ping(1)).unwrap();
        b.open(&f).unwrap();
        assert!(matches!(b.open(&f), Err(SessionError::Replay { seq: 1, last: 1 })));
    }

    #[test]
    fn gaps_are_allowed() {
        let (mut a, mut b) = pair();
        let _lost = a.seal(&ping(1)).unwrap();
        let f2 = a.seal(&ping(2)).unwrap();
        assert_eq!(b.open(&f2).unwrap(), ping(2));
    }

    #[test]
    fn header_is_authenticated() {
        let (mut a, mut b) = pair();
        let mut f = a.seal(&ping(1)).unwrap();
        f.header.msg_id = crate::wire::ids::PONG;
        let err = b.open(&f).unwrap_err();
        assert!(matches!(err, SessionError::DecryptFailed { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn tampered_digest_fails_closed() {
        let (mut a, mut b) = pair();
        let mut f = a.seal(&ping(1)).unwrap();
        // The digest is covered by the AAD, so tampering it fails the tag.
        f.header.digest8 ^= 1;
        assert!(b.open(&f).is_err());
    }

    #[test]
    fn rekey_is_followed_by_receiver() {
        let (mut a, mut b) = pair();
        b.open(&a.seal(&ping(1)).unwrap()).unwrap();
        a.rekey_send().unwrap();
        let f = a.seal(&ping(2)).unwrap();
        assert!(f.header.is_rekey());
        assert_eq!(f.header.seq, 1);
        assert_eq!(b.open(&f).unwrap(), ping(2));
        assert_eq!(b.recv_position(), (1, 1));

        let f = a.seal(&ping(3)).unwrap();
        assert!(!f.header.is_rekey());
        assert_eq!(b.open(&f).unwrap(), ping(3));
    }

    #[test]
    fn lost_rekey_frame_is_recovered_from_adjacent_generation() {
        let (mut a, mut b) = pair();
        a.rekey_send().unwrap();
        let _lost = a.seal(&ping(1)).unwrap();
        let f = a.seal(&ping(2)).unwrap();
        assert!(!f.header.is_rekey());
        assert_eq!(b.open(&f).unwrap(), ping(2));
        assert_eq!(b.recv_position().0, 1);
    }

    #[test]
    fn unauthenticated_rekey_is_fatal() {
        let (mut a, mut b) = pair();
        a.rekey_send().unwrap();
        let mut f = a.seal(&ping(1)).unwrap();
        let mut payload = f.payload.to_vec();
        payload[0] ^= 1;
        f.payload = Bytes::from(payload);
        let err = b.open(&f).unwrap_err();
        assert!(matches!(err, SessionError::RekeyFailed { announced: 1 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn replayed_rekey_frame_is_an_ordinary_replay() {
        let (mut a, mut b) = pair();
        a.rekey_send().unwrap();
        let f = a.seal(&ping(1)).unwrap();
        assert_eq!(b.open(&f).unwrap(), ping(1));
        assert_eq!(b.recv_position(), (1, 1));

        let err = b.open(&f).unwrap_err();
        assert!(matches!(err, SessionError::Replay { seq: 1, last: 1 }));
        assert!(!err.is_fatal());

        let next = a.seal(&ping(2)).unwrap();
        assert_eq!(b.open(&next).unwrap(), ping(2));
    }

    #[test]
    fn frame_count_triggers_rekey() {
        let (mut a, mut b) = pair_with(SessionConfig {
            rekey_after_frames: 3,
            ..SessionConfig::default()
        });
        for n in 0..7 {
            let f = a.seal(&ping(n)).unwrap();
            assert_eq!(b.open(&f).unwrap(), ping(n));
        }
        assert_eq!(a.send_position().0, 2);
        assert_eq!(b.recv_position().0, 2);
    }

    #[test]
    fn nonces_never_repeat_across_rekeys() {
        let (mut a, _) = pair_with(SessionConfig {
            rekey_after_frames: 5,
            ..SessionConfig::default()
        });
        let mut seen = HashSet::new();
        for n in 0..40 {
            a.seal(&ping(n)).unwrap();
            let (generation, seq) = a.send_position();
            let nonce = frame_nonce(&a.send.base, generation, seq as u64);
            assert!(seen.insert((a.send.base, nonce)));
            assert!(seen.len() == n as usize + 1);
        }
        // Same base, different generations: counters differ in the top bytes.
        let base = [0u8; 12];
        assert_ne!(frame_nonce(&base, 0, 1), frame_nonce(&base, 1, 1));
    }

    #[test]
    fn failure_burst_is_fatal() {
        let (mut a, mut b) = pair_with(SessionConfig {
            decrypt_failure_burst: 2,
            ..SessionConfig::default()
        });
        let mut results = Vec::new();
        for n in 0..3 {
            let mut f = a.seal(&ping(n)).unwrap();
            let mut payload = f.payload.to_vec();
            payload[0] ^= 1;
            f.payload = Bytes::from(payload);
            results.push(b.open(&f).unwrap_err());
        }
        assert!(!results[0].is_fatal());
        assert!(!results[1].is_fatal());
        assert!(matches!(results[2], SessionError::FailureBurst(3)));
    }

    #[test]
    fn plaintext_frames_are_refused() {
        let (_, mut b) = pair();
        let f = Frame::plaintext(&ping(1)).unwrap();
        assert!(matches!(b.open(&f), Err(SessionError::UnexpectedPlaintext)));
    }
}
