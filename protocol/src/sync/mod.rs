//! # Chain Synchronization
//!
//! Keeps the local header frontier and body store in step with the network.
//!
//! ```text
//! peer ready ──> getheaders(locator) ──> headers ──> frontier (fork choice)
//!                                                        │
//!                 getblocks <── hedged fetch queue <─────┘
//!                     │
//!                   blocks ──> structural checks ──> SyncEvent::Body
//! ```
//!
//! The coordinator is the only writer of sync state. Gossip reads it through
//! [`ChainView`] and talks back through [`SyncRequest`]s; everything sync wants
//! the network to do comes out as [`SyncAction`]s and everything it wants the
//! node to know comes out as [`SyncEvent`]s.
//!
//! Deep reorganisations are treated as suspect. Past the soft depth a branch
//! needs corroboration from several peers; past the hard depth body import
//! stops (safe mode) until an operator lifts it, unless late finalization is
//! enabled.

pub mod chain_view;
pub mod coordinator;
pub mod fetch;
pub mod frontier;
pub mod header;
pub mod orphans;
pub mod relay;
pub mod state;
pub mod suspect;

pub use chain_view::{BlockSource, ChainView, ConsensusView, HeadInfo};
pub use coordinator::{SyncAction, SyncCoordinator, SyncEvent};
pub use fetch::{BodyFetcher, FetchRequest};
pub use frontier::{Attach, Frontier, FrontierError, Reorg};
pub use header::HeaderError;
pub use orphans::OrphanPool;
pub use relay::{RelayConfig, RelayReject, ShareRelay, TxRelay};
pub use state::ConnState;
pub use suspect::{Corroborated, Expired, SuspectHeaders};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    FETCH_TIMEOUT, HARD_REORG_DEPTH, HEADER_BATCH, HEDGE_FANOUT, MAX_BLOCKS_PER_REQUEST,
    MAX_CLOCK_SKEW, MAX_FETCH_ATTEMPTS, MAX_HEADERS_PER_MESSAGE, MAX_ORPHANS, MAX_SUSPECTS,
    MIN_CORROBORATING_PEERS, ORPHAN_TTL, SOFT_REORG_DEPTH, STRIKE_WINDOW, STRUCTURAL_STRIKES,
    SUSPECT_TTL,
};
use crate::error::Severity;
use crate::types::{Hash32, PeerId};
use crate::wire::objects::BlockHeader;

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Headers requested per `getheaders`.
    pub header_batch: usize,
    /// Most headers accepted in, or served from, one message.
    pub max_headers_per_message: usize,
    /// Most hashes in one `getblocks`.
    pub max_blocks_per_request: usize,
    /// Announcers each body is requested from at once.
    pub hedge_fanout: usize,
    /// Outstanding body requests per peer. Halved under backpressure.
    pub max_in_flight_per_peer: usize,
    pub fetch_timeout_ms: u64,
    /// Scheduling rounds per body before it is abandoned.
    pub max_fetch_attempts: u32,
    pub orphan_ttl_ms: u64,
    pub max_orphans: usize,
    /// Reorgs deeper than this need corroboration.
    pub soft_reorg_depth: u64,
    /// Reorgs deeper than this enter safe mode.
    pub hard_reorg_depth: u64,
    pub min_corroborating_peers: usize,
    pub max_clock_skew_ms: u64,
    /// Adopt a corroborated branch beyond the hard depth instead of
    /// entering safe mode.
    pub late_finalization: bool,
    /// How long a header breaking the threshold step waits for
    /// `min_corroborating_peers` announcers.
    pub suspect_ttl_ms: u64,
    pub max_suspects: usize,
    /// Structural failures tolerated per peer inside the strike window.
    pub structural_strikes: usize,
    pub strike_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            header_batch: HEADER_BATCH,
            max_headers_per_message: MAX_HEADERS_PER_MESSAGE,
            max_blocks_per_request: MAX_BLOCKS_PER_REQUEST,
            hedge_fanout: HEDGE_FANOUT,
            max_in_flight_per_peer: 4 * MAX_BLOCKS_PER_REQUEST,
            fetch_timeout_ms: FETCH_TIMEOUT.as_millis() as u64,
            max_fetch_attempts: MAX_FETCH_ATTEMPTS,
            orphan_ttl_ms: ORPHAN_TTL.as_millis() as u64,
            max_orphans: MAX_ORPHANS,
            soft_reorg_depth: SOFT_REORG_DEPTH,
            hard_reorg_depth: HARD_REORG_DEPTH,
            min_corroborating_peers: MIN_CORROBORATING_PEERS,
            max_clock_skew_ms: MAX_CLOCK_SKEW.as_millis() as u64,
            late_finalization: false,
            suspect_ttl_ms: SUSPECT_TTL.as_millis() as u64,
            max_suspects: MAX_SUSPECTS,
            structural_strikes: STRUCTURAL_STRIKES,
            strike_window_ms: STRIKE_WINDOW.as_millis() as u64,
        }
    }
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_millis(self.orphan_ttl_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }

    pub fn suspect_ttl(&self) -> Duration {
        Duration::from_millis(self.suspect_ttl_ms)
    }

    pub fn strike_window(&self) -> Duration {
        Duration::from_millis(self.strike_window_ms)
    }
}

// ---------------------------------------------------------------------------
// Requests from gossip
// ---------------------------------------------------------------------------

/// What gossip asks of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// A gossiped header referenced a parent we do not have.
    MissingParent {
        peer: PeerId,
        parent: Hash32,
        height: u64,
    },
    /// A gossiped header whose threshold is far from ours. Sync holds it
    /// until enough peers vouch for it.
    SuspectHeader { peer: PeerId, header: BlockHeader },
    /// Global gossip pressure changed.
    Backpressure(bool),
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Frontier(#[from] FrontierError),

    #[error(transparent)]
    Relay(#[from] RelayReject),

    #[error("body {0} was not requested")]
    Unsolicited(Hash32),

    #[error("body root does not match header {0}")]
    BodyRootMismatch(Hash32),

    #[error("body for {hash} is {len} bytes, over the block cap")]
    BodyTooLarge { hash: Hash32, len: usize },

    #[error("body for {hash} rejected by consensus preview: {reason}")]
    BodyRejected { hash: Hash32, reason: String },

    #[error("peer {0} is not ready")]
    NotReady(PeerId),

    #[error("header {hash} found {announcers} of {needed} corroborating peers in time")]
    Uncorroborated {
        hash: Hash32,
        announcers: usize,
        needed: usize,
    },

    #[error("illegal connection state change {from:?} -> {to:?}")]
    IllegalTransition { from: ConnState, to: ConnState },
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Header(e) => e.severity(),
            Self::Frontier(e) => e.severity(),
            Self::Relay(e) => e.severity(),
            Self::IllegalTransition { .. } => Severity::Fatal,
            Self::Uncorroborated { .. } => Severity::Consistency,
            Self::Unsolicited(_) | Self::NotReady(_) => Severity::Soft,
            Self::BodyRootMismatch(_)
            | Self::BodyTooLarge { .. }
            | Self::BodyRejected { .. } => Severity::Structural,
        }
    }
}
