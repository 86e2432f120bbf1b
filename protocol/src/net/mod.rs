//! # Network
//!
//! Tokio glue around the sans-IO layers. A connection is any
//! `AsyncRead + AsyncWrite` stream:
//!
//! ```text
//! transport ──> FrameCodec ──> handshake driver ──> Session ──> identify
//!                                                                 │
//!        ┌──────────── reader task <─────── frames ───────────────┤
//!        │                                                         │
//!   NetEvent ──> P2pService (gossip, sync, address book)   writer task
//!                      │                                          ^
//!                      └──────────── Outbound (per-peer mpsc) ────┘
//! ```
//!
//! One [`P2pService`] task owns the gossip engine and the sync coordinator
//! and processes every connection's events in order.

pub mod connection;
pub mod handshake;
pub mod penalty;
pub mod service;

pub use connection::{exchange_identify, ConnContext};
pub use handshake::{initiate, respond};
pub use penalty::{PenaltyPolicy, Sanction};
pub use service::{P2pService, ServiceHandle, ServiceStatus};

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::CryptoError;
use crate::error::Severity;
use crate::flow::FlowError;
use crate::gossip::GossipReject;
use crate::handshake::HandshakeError;
use crate::session::SessionError;
use crate::sync::SyncError;
use crate::types::PeerId;
use crate::wire::messages::{Bye, Identify};
use crate::wire::{Message, WireError};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("flow: {0}")]
    Flow(#[from] FlowError),

    #[error("sync: {0}")]
    Sync(#[from] SyncError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("gossip: {0}")]
    Gossip(#[from] GossipReject),

    #[error("no identify within the deadline")]
    IdentifyTimeout,

    #[error("identify mismatch: {0}")]
    IdentifyMismatch(String),

    #[error("expected identify, got {0}")]
    ExpectedIdentify(&'static str),

    #[error("peer said bye ({code}): {reason}")]
    Bye { code: u16, reason: String },

    #[error("{0} pings unanswered")]
    PingTimeout(u32),

    #[error("send credit stalled")]
    FlowStall,

    #[error("connection closed")]
    Closed,

    #[error("service stopped")]
    ServiceStopped,

    #[error("peer {0:?} is not connected")]
    NotConnected(PeerId),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Handshake(e) => e.severity(),
            Self::Session(e) => e.severity(),
            Self::Wire(e) => e.severity(),
            Self::Flow(e) => e.severity(),
            Self::Sync(e) => e.severity(),
            Self::Crypto(e) => e.severity(),
            Self::Gossip(e) => e.severity(),
            Self::IdentifyTimeout
            | Self::IdentifyMismatch(_)
            | Self::ExpectedIdentify(_)
            | Self::PingTimeout(_)
            | Self::FlowStall
            | Self::Io(_) => Severity::Fatal,
            Self::Bye { .. } | Self::Closed | Self::ServiceStopped | Self::NotConnected(_) => {
                Severity::Soft
            }
        }
    }

    /// Whether the remote end is to blame, for address book feedback.
    pub fn is_misbehavior(&self) -> bool {
        match self {
            Self::Handshake(
                HandshakeError::Timeout(_) | HandshakeError::Closed | HandshakeError::Wire(WireError::Io(_)),
            ) => false,
            Self::Handshake(_) | Self::Session(_) | Self::Flow(_) => true,
            Self::Wire(e) => !matches!(e, WireError::Io(_)),
            Self::IdentifyMismatch(_) | Self::ExpectedIdentify(_) => true,
            _ => false,
        }
    }
}

/// What a connection task hands to the service.
#[derive(Debug)]
pub enum NetEvent {
    /// Handshake and identify done.
    Ready {
        peer: PeerId,
        addr: Option<SocketAddr>,
        outbound: bool,
        identify: Identify,
        handle: PeerHandle,
    },
    Message {
        peer: PeerId,
        message: Message,
    },
    /// A frame over its size cap was discarded unread.
    Oversize {
        peer: PeerId,
        msg_id: u16,
    },
    /// A frame failed to open but the connection survives.
    Invalid {
        peer: PeerId,
        outcome: &'static str,
    },
    /// The handshake or identify failed; no session ever existed.
    Failed {
        addr: Option<SocketAddr>,
        error: NetError,
    },
    Closed {
        peer: PeerId,
        addr: Option<SocketAddr>,
        error: Option<NetError>,
    },
}

/// What the service asks a connection's writer to do.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    /// Send `bye` and close.
    Close(Bye),
}

/// Service-side handle to one live connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub(crate) fn new(tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Queue a message. Returns `false` when the queue is full or the
    /// connection is gone; gossip is best effort.
    pub fn send(&self, message: Message) -> bool {
        self.tx.try_send(Outbound::Message(message)).is_ok()
    }

    /// Say bye and close. Falls back to a hard close if the queue is full.
    pub fn close(&self, code: u16, reason: &str) {
        let bye = Bye {
            code,
            reason: reason.to_string(),
        };
        if self.tx.try_send(Outbound::Close(bye)).is_err() {
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_and_blame() {
        assert!(NetError::IdentifyTimeout.severity().is_fatal());
        assert!(!NetError::Closed.severity().is_fatal());
        assert!(NetError::Handshake(HandshakeError::PolicyMismatch).is_misbehavior());
        assert!(!NetError::Handshake(HandshakeError::Timeout("reply")).is_misbehavior());
        assert!(!NetError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_misbehavior());
    }

    #[tokio::test]
    async fn handle_close_queues_bye() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = PeerHandle::new(tx, CancellationToken::new());
        handle.close(3, "shutdown");
        match rx.recv().await {
            Some(Outbound::Close(bye)) => assert_eq!(bye.code, 3),
            other => panic!("unexpected {other:?}"),
        }
        // Queue full: falls back to cancelling.
        assert!(handle.send(Message::Pause));
        handle.close(3, "shutdown");
        assert!(handle.is_closed());
    }
}
