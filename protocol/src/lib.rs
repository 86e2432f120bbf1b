// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera P2P
//!
//! The networking core of a Tessera node: an authenticated, post-quantum
//! encrypted session layer, topic gossip with peer scoring, and header-first
//! chain sync with hedged body fetches.
//!
//! ## Architecture
//!
//! The protocol layers are sans-IO and only the `net` module touches tokio
//! transports:
//!
//! - **crypto**: Identity keys, ML-KEM, AEAD ciphers, BLAKE3 helpers.
//! - **handshake**: Four-message mutual authentication and key schedule.
//! - **session**: Per-connection AEAD framing with rekey and replay checks.
//! - **wire**: Frame header, codec and the closed message enum.
//! - **flow**: Credit windows per direction.
//! - **gossip**: Dedup, rate limits, scores, mesh and the gossip pipeline.
//! - **sync**: Frontier, fork choice, orphans, body fetches, tx/share relay.
//! - **peer**: Address book, dial backoff, ping RTT.
//! - **net**: Connection tasks and the service that ties it all together.
//! - **metrics**: Prometheus handles for every layer.
//! - **config**: Protocol constants and the aggregate `P2pConfig`.
//!
//! ## Design Philosophy
//!
//! 1. Every failure has a severity, and the severity decides the response.
//! 2. Nothing buffers without a bound.
//! 3. Sync never trusts a single peer with a deep reorg.

pub mod config;
pub mod crypto;
pub mod error;
pub mod flow;
pub mod gossip;
pub mod handshake;
pub mod metrics;
pub mod net;
pub mod peer;
pub mod session;
pub mod sync;
pub mod types;
pub mod wire;

pub use config::P2pConfig;
pub use crypto::IdentityKeypair;
pub use error::Severity;
pub use net::{P2pService, ServiceHandle, ServiceStatus};
pub use types::{Hash32, PeerId};
