//! # Handshake
//!
//! Mutual authentication and key agreement for a fresh connection. Both
//! sides contribute an ephemeral Kyber-768 encapsulation; the two shared
//! secrets, bound to the transcript, produce the chaining key from which
//! the AEAD session is keyed. Identities are long-term Ed25519 or ML-DSA-44
//! keys that sign the transcript hash.
//!
//! The state machine in [`engine`] does no I/O. `net::handshake` drives it
//! over a framed stream with per-step timeouts.

pub mod engine;
pub mod error;
pub mod key_schedule;
pub mod transcript;

pub use engine::{
    HandshakeOutcome, Initiator, InitiatorAwaitAccept, InitiatorAwaitReply, LocalHead, Responder,
    ResponderAwaitFinish,
};
pub use error::HandshakeError;
pub use key_schedule::{KeySchedule, Role, TrafficKeys};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{CHAIN_ID_DEVNET, DEFAULT_AGENT, HANDSHAKE_STEP_TIMEOUT, WIRE_VERSION};
use crate::crypto::{AeadAlg, AlgorithmPolicy};

/// Handshake parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub version: u16,
    pub chain_id: u64,
    /// AEADs we accept, in preference order.
    pub aead: Vec<AeadAlg>,
    pub policy: AlgorithmPolicy,
    /// Feature bits advertised in our hello.
    pub features: u64,
    pub agent: String,
    /// Per-step deadline. Missing it is fatal.
    pub step_timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            version: WIRE_VERSION,
            chain_id: CHAIN_ID_DEVNET,
            aead: vec![AeadAlg::Aes256Gcm, AeadAlg::ChaCha20Poly1305],
            policy: AlgorithmPolicy::default(),
            features: 0,
            agent: DEFAULT_AGENT.to_string(),
            step_timeout_ms: HANDSHAKE_STEP_TIMEOUT.as_millis() as u64,
        }
    }
}

impl HandshakeConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}
