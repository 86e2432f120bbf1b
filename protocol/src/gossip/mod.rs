//! # Gossip
//!
//! Topic-based propagation of headers, transactions, shares and blob
//! announcements. Every inbound [`GossipEnvelope`](crate::wire::messages::GossipEnvelope)
//! walks the same pipeline, cheapest stage first:
//!
//! 1. size gate
//! 2. envelope sanity (known topic, supported schema, checksum)
//! 3. dedup against the topic's [`DedupWindow`]
//! 4. topic cheap checks ([`validate`])
//! 5. token-bucket admission ([`RateLimiter`])
//! 6. sampled heavy verification ([`SamplingPool`]), applied later as a
//!    score update only
//!
//! A message that clears stages 1 to 5 is forwarded at once along the topic
//! mesh. Peer behaviour feeds [`PeerScoreTable`], whose standing decides
//! whether a peer's control messages are honoured, whether anything it sends
//! is forwarded, and when it is disconnected.

pub mod dedup;
pub mod engine;
pub mod mesh;
pub mod ratelimit;
pub mod sampling;
pub mod score;
pub mod validate;

pub use dedup::DedupWindow;
pub use engine::{GossipEngine, GossipVerdict, HeartbeatOutput, Published};
pub use mesh::{ControlCommand, GraftOutcome, Mesh, MeshParams};
pub use ratelimit::{Admission, RateLimitConfig, RateLimiter, TokenBucket};
pub use sampling::{HeavyVerifier, SampleResult, SamplingPool};
pub use score::{PeerScoreTable, ScoreEvent, ScoreParams, Standing};
pub use validate::GossipObject;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    DEDUP_GENERATIONS, DEDUP_ITEMS_PER_GENERATION, DEDUP_ROTATE_INTERVAL, MAX_BLOB_BYTES,
    MAX_CLOCK_SKEW, MAX_HEADER_BYTES, MAX_SHARE_BYTES, MAX_TX_BYTES, SAMPLE_RATE_BASE,
    SAMPLING_CONCURRENCY, SHARE_MAX_AGE,
};
use crate::error::Severity;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// The closed set of gossip topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Headers,
    Tx,
    Shares,
    Blobs,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Headers, Topic::Tx, Topic::Shares, Topic::Blobs];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::Tx => "tx",
            Self::Shares => "shares",
            Self::Blobs => "blobs",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Payload schema version this build understands.
    pub fn schema(self) -> u16 {
        1
    }

    /// Largest `data` a gossip envelope on this topic may carry.
    pub fn max_data_len(self) -> usize {
        match self {
            Self::Headers => MAX_HEADER_BYTES,
            Self::Tx => MAX_TX_BYTES,
            Self::Shares => MAX_SHARE_BYTES,
            Self::Blobs => 256,
        }
    }

    /// Priority topics keep their normal bucket cost under backpressure.
    pub fn is_priority(self) -> bool {
        matches!(self, Self::Headers)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pipeline settings that are not part of scoring, mesh or rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Bloom generations per dedup window.
    pub dedup_generations: usize,
    /// Insertions per generation before rotation.
    pub dedup_items_per_generation: usize,
    /// Age of the newest generation before rotation.
    pub dedup_rotate_interval_ms: u64,
    /// Target false-positive rate of each bloom generation.
    pub dedup_fp_rate: f64,
    /// Heavy checks sample one message in this many from a neutral peer.
    pub sample_rate_base: u32,
    /// Concurrent heavy checks.
    pub sampling_concurrency: usize,
    /// Completed sample results buffered before the pool stops dispatching.
    pub sampling_queue: usize,
    /// Allowed drift of header timestamps into the future.
    pub max_clock_skew_ms: u64,
    /// Share proof types relayed by this node.
    pub allowed_share_types: Vec<u8>,
    /// Oldest share metrics accepted.
    pub share_max_age_ms: u64,
    /// Smallest share ratio (micro-units) worth relaying.
    pub min_share_ratio: u64,
    /// Allowed relative disagreement between a share's claimed ratio and the
    /// ratio recomputed against the current threshold, in parts per million.
    pub share_ratio_tolerance_ppm: u64,
    /// Largest blob an announcement may describe.
    pub max_blob_bytes: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            dedup_generations: DEDUP_GENERATIONS,
            dedup_items_per_generation: DEDUP_ITEMS_PER_GENERATION,
            dedup_rotate_interval_ms: DEDUP_ROTATE_INTERVAL.as_millis() as u64,
            dedup_fp_rate: 0.001,
            sample_rate_base: SAMPLE_RATE_BASE,
            sampling_concurrency: SAMPLING_CONCURRENCY,
            sampling_queue: 1024,
            max_clock_skew_ms: MAX_CLOCK_SKEW.as_millis() as u64,
            allowed_share_types: vec![1, 2, 3, 4, 5],
            share_max_age_ms: SHARE_MAX_AGE.as_millis() as u64,
            min_share_ratio: 1_000,
            share_ratio_tolerance_ppm: 250_000,
            max_blob_bytes: MAX_BLOB_BYTES,
        }
    }
}

impl GossipConfig {
    pub fn dedup_rotate_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_rotate_interval_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }

    pub fn share_max_age(&self) -> Duration {
        Duration::from_millis(self.share_max_age_ms)
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why a gossip message was not forwarded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GossipReject {
    #[error("payload of {len} bytes exceeds {max}")]
    Oversize { len: usize, max: usize },

    #[error("unknown topic {0:?}")]
    UnknownTopic(String),

    #[error("unsupported schema {schema} on {topic}")]
    UnsupportedSchema { topic: Topic, schema: u16 },

    #[error("envelope checksum does not match data")]
    ChecksumMismatch,

    #[error("malformed {topic} payload: {reason}")]
    Malformed { topic: Topic, reason: String },

    #[error("already seen")]
    Duplicate,

    #[error("already part of the local chain")]
    Stale,

    #[error("not subscribed to {0}")]
    NotSubscribed(Topic),

    #[error("chain id mismatch: expected {expected:#x}, got {got:#x}")]
    ChainMismatch { expected: u64, got: u64 },

    #[error("signature does not have the shape of its algorithm")]
    SignatureShape,

    #[error("policy root must be exactly 32 bytes")]
    PolicyRootLength,

    #[error("header commits to a different policy root")]
    PolicyMismatch,

    #[error("threshold {got} too far from current {current}")]
    ThresholdShock { current: u64, got: u64 },

    #[error("timestamp {timestamp} is ahead of local clock {now}")]
    ClockSkew { timestamp: u64, now: u64 },

    #[error("share type {0} not relayed")]
    ShareType(u8),

    #[error("share nullifier is zero")]
    ZeroNullifier,

    #[error("share ratio {claimed} disagrees with recomputed {recomputed}")]
    ShareRatio { claimed: u64, recomputed: u64 },

    #[error("share metrics are {age_secs}s old")]
    StaleMetrics { age_secs: u64 },

    #[error("blob announcement: {0}")]
    BadBlob(&'static str),

    #[error("peer over its quota")]
    OverQuota,

    #[error("global quota exhausted")]
    GlobalOverQuota,

    #[error("peer is banned")]
    Banned,
}

impl GossipReject {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Banned => Severity::Fatal,
            Self::ThresholdShock { .. } => Severity::Consistency,
            _ => Severity::Soft,
        }
    }

    /// Soft drops are not the sender's fault; hard drops suppress the
    /// message and cost the sender score. A threshold shock is neither
    /// until sync has heard from enough peers.
    pub fn is_hard(&self) -> bool {
        !matches!(
            self,
            Self::Duplicate
                | Self::Stale
                | Self::NotSubscribed(_)
                | Self::OverQuota
                | Self::GlobalOverQuota
                | Self::ThresholdShock { .. }
        )
    }

    /// Score event charged to the direct sender, if any.
    pub fn penalty(&self) -> Option<ScoreEvent> {
        match self {
            Self::Duplicate
            | Self::Stale
            | Self::NotSubscribed(_)
            | Self::GlobalOverQuota
            | Self::ThresholdShock { .. }
            | Self::Banned => None,
            Self::OverQuota => Some(ScoreEvent::Flood),
            Self::Oversize { .. } => Some(ScoreEvent::Oversize),
            _ => Some(ScoreEvent::Invalid),
        }
    }

    /// Metrics label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Oversize { .. } => "oversize",
            Self::UnknownTopic(_) => "unknown_topic",
            Self::UnsupportedSchema { .. } => "schema",
            Self::ChecksumMismatch => "checksum",
            Self::Malformed { .. } => "malformed",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::NotSubscribed(_) => "not_subscribed",
            Self::ChainMismatch { .. } => "chain",
            Self::SignatureShape => "sig_shape",
            Self::PolicyRootLength => "policy_root",
            Self::PolicyMismatch => "policy_mismatch",
            Self::ThresholdShock { .. } => "threshold",
            Self::ClockSkew { .. } => "clock_skew",
            Self::ShareType(_) => "share_type",
            Self::ZeroNullifier => "nullifier",
            Self::ShareRatio { .. } => "share_ratio",
            Self::StaleMetrics { .. } => "stale_metrics",
            Self::BadBlob(_) => "blob",
            Self::OverQuota => "over_quota",
            Self::GlobalOverQuota => "global_quota",
            Self::Banned => "banned",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("blocks"), None);
        assert_eq!(Topic::Tx.to_string(), "tx");
    }

    #[test]
    fn soft_drops_carry_no_penalty() {
        assert!(!GossipReject::Duplicate.is_hard());
        assert_eq!(GossipReject::Duplicate.penalty(), None);
        assert_eq!(GossipReject::OverQuota.penalty(), Some(ScoreEvent::Flood));
        assert!(GossipReject::ChecksumMismatch.is_hard());
        assert_eq!(
            GossipReject::Oversize { len: 2, max: 1 }.penalty(),
            Some(ScoreEvent::Oversize)
        );
    }

    #[test]
    fn threshold_shock_is_a_consistency_error() {
        let err = GossipReject::ThresholdShock { current: 1, got: 100 };
        assert_eq!(err.severity(), Severity::Consistency);
        assert!(!err.severity().is_fatal());
        assert!(!err.is_hard());
        assert_eq!(err.penalty(), None);
        assert!(GossipReject::Banned.severity().is_fatal());
    }
}
