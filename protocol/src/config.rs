//! # Protocol Configuration & Constants
//!
//! Every tunable of the transport and sync engine starts life here as a
//! constant. Module-level config structs (`GossipConfig`, `SyncConfig`, ...)
//! take their `Default` values from these, and [`P2pConfig`] bundles them so
//! the node binary can load, override, and hand one value to the service.
//!
//! Wire-visible constants (salt, KDF contexts, header length) are part of the
//! protocol. Changing them splits the network.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flow::FlowConfig;
use crate::gossip::mesh::MeshParams;
use crate::gossip::ratelimit::RateLimitConfig;
use crate::gossip::score::ScoreParams;
use crate::gossip::GossipConfig;
use crate::handshake::HandshakeConfig;
use crate::peer::PeerConfig;
use crate::session::SessionConfig;
use crate::sync::relay::RelayConfig;
use crate::sync::SyncConfig;

// ---------------------------------------------------------------------------
// Chain Identifiers
// ---------------------------------------------------------------------------

/// Mainnet chain id. Carried in every hello and every header.
pub const CHAIN_ID_MAINNET: u64 = 0x5445_5353_0000_0001;

/// Testnet chain id.
pub const CHAIN_ID_TESTNET: u64 = 0x5445_5353_0000_0002;

/// Devnet chain id. Reset whenever someone needs a clean slate.
pub const CHAIN_ID_DEVNET: u64 = 0x5445_5353_0000_00FF;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate version string reported by `identify` and the node's `/status`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version. Peers must match exactly during the handshake.
pub const WIRE_VERSION: u16 = 1;

/// Agent string announced in hello and identify.
pub const DEFAULT_AGENT: &str = "tessera/0.1";

// ---------------------------------------------------------------------------
// Key Derivation
// ---------------------------------------------------------------------------

/// BLAKE3 `derive_key` context for the handshake chaining key.
pub const CHAINING_KEY_CONTEXT: &str = "tessera p2p v1 handshake chaining key";

/// BLAKE3 `derive_key` context for per-generation traffic keys.
pub const TRAFFIC_KEY_CONTEXT: &str = "tessera p2p v1 traffic keys";

/// BLAKE3 `derive_key` context for the rekey ratchet.
pub const REKEY_CONTEXT: &str = "tessera p2p v1 rekey";

/// Fixed salt mixed into the chaining key.
pub const HANDSHAKE_SALT: &[u8] = b"tessera/p2p/handshake/salt/v1";

/// Domain tag prepended to the transcript hash before signing.
pub const AUTH_SIGN_DOMAIN: &[u8] = b"tessera/p2p/auth/v1";

// ---------------------------------------------------------------------------
// AEAD
// ---------------------------------------------------------------------------

/// Symmetric key length for both supported AEADs.
pub const AEAD_KEY_LENGTH: usize = 32;

/// Nonce length (96 bits) for both supported AEADs.
pub const AEAD_NONCE_LENGTH: usize = 12;

/// Authentication tag appended to every sealed payload.
pub const AEAD_TAG_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Fixed frame header: msg_id(2) seq(4) flags(2) digest8(8) payload_len(4).
pub const FRAME_HEADER_LENGTH: usize = 20;

/// Absolute ceiling on any single frame payload, regardless of message type.
pub const MAX_FRAME_PAYLOAD: usize = 8 * 1024 * 1024;

/// Consecutive oversize frames tolerated on one connection before it is closed.
pub const MAX_OVERSIZE_FRAMES: u32 = 8;

/// Maximum encoded size of a single block header.
pub const MAX_HEADER_BYTES: usize = 1024;

/// Maximum encoded size of a single block body.
pub const MAX_BLOCK_BYTES: usize = 4 * 1024 * 1024;

/// Maximum encoded size of a single transaction.
pub const MAX_TX_BYTES: usize = 1024 * 1024;

/// Maximum encoded size of a single share envelope.
pub const MAX_SHARE_BYTES: usize = 256 * 1024;

/// Maximum inventory entries per inv/getdata/notfound.
pub const MAX_INV_ITEMS: usize = 4096;

// ---------------------------------------------------------------------------
// Session Timing
// ---------------------------------------------------------------------------

/// Budget for each handshake step. Expiry is fatal.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed between `Authenticated` and receipt of the peer's identify.
pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames sent in one direction before the sender ratchets its keys.
pub const REKEY_AFTER_FRAMES: u64 = 1 << 24;

/// Wall-clock age of a key generation before the sender ratchets.
pub const REKEY_AFTER: Duration = Duration::from_secs(600);

/// Decrypt failures tolerated within [`DECRYPT_FAILURE_WINDOW`].
pub const DECRYPT_FAILURE_BURST: u32 = 8;

/// Sliding window for counting decrypt failures.
pub const DECRYPT_FAILURE_WINDOW: Duration = Duration::from_secs(10);

/// Interval between keep-alive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

/// Maximum simultaneously connected peers.
pub const MAX_PEERS: usize = 50;

/// Target mesh degree per topic.
pub const MESH_D: usize = 6;

/// Lower bound before the heartbeat grafts.
pub const MESH_D_LOW: usize = 4;

/// Upper bound before the heartbeat prunes.
pub const MESH_D_HIGH: usize = 12;

/// Mesh heartbeat period.
pub const MESH_HEARTBEAT: Duration = Duration::from_secs(1);

/// How long a pruned peer must wait before grafting again.
pub const PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// Fanout entries expire after this long without use.
pub const FANOUT_TTL: Duration = Duration::from_secs(60);

/// Outbound peers the heartbeat tries to keep in each mesh.
pub const MESH_D_OUT: usize = 2;

/// Heartbeats between opportunistic graft rounds.
pub const OPPORTUNISTIC_GRAFT_TICKS: u64 = 15;

/// Score-decay time constant.
pub const SCORE_DECAY_TAU: Duration = Duration::from_secs(300);

/// Below this score control messages are ignored and fanout shrinks.
pub const GREYLIST_THRESHOLD: f64 = -20.0;

/// Below this score nothing the peer sends is forwarded.
pub const QUARANTINE_THRESHOLD: f64 = -40.0;

/// Below this score the peer is disconnected and dial-blocked.
pub const BAN_THRESHOLD: f64 = -80.0;

/// First ban duration. Doubles per repeat offense.
pub const BAN_BASE: Duration = Duration::from_secs(60);

/// Longest ban.
pub const BAN_MAX: Duration = Duration::from_secs(24 * 3600);

/// Global bucket starvation must last this long to count as backpressure.
pub const PRESSURE_WINDOW: Duration = Duration::from_secs(5);

/// Oldest share metrics accepted by the cheap checks.
pub const SHARE_MAX_AGE: Duration = Duration::from_secs(120);

/// Largest blob a blob announcement may describe.
pub const MAX_BLOB_BYTES: u64 = 2 * 1024 * 1024;

/// Generations kept by each dedup window.
pub const DEDUP_GENERATIONS: usize = 3;

/// Insertions per generation before a rotation is forced.
pub const DEDUP_ITEMS_PER_GENERATION: usize = 8192;

/// Age of the newest generation before a rotation is forced.
pub const DEDUP_ROTATE_INTERVAL: Duration = Duration::from_secs(60);

/// Baseline heavy-check sampling: one message in this many.
pub const SAMPLE_RATE_BASE: u32 = 16;

/// Concurrent heavy checks allowed in the sampling pool.
pub const SAMPLING_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Dense (step 1) entries at the head of a locator.
pub const LOCATOR_DENSE_ENTRIES: usize = 10;

/// Maximum locator length.
pub const LOCATOR_MAX_ENTRIES: usize = 32;

/// Headers requested per getheaders.
pub const HEADER_BATCH: usize = 128;

/// Hard cap on headers accepted in one message.
pub const MAX_HEADERS_PER_MESSAGE: usize = 512;

/// Bodies requested per getblocks.
pub const MAX_BLOCKS_PER_REQUEST: usize = 16;

/// Peers raced for each missing body.
pub const HEDGE_FANOUT: usize = 3;

/// Per-batch body fetch timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per body before it goes back to waiting on announcements.
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Orphan lifetime.
pub const ORPHAN_TTL: Duration = Duration::from_secs(120);

/// Orphan pool capacity.
pub const MAX_ORPHANS: usize = 1024;

/// How long a header that breaks the threshold step waits for other peers
/// to vouch for it.
pub const SUSPECT_TTL: Duration = Duration::from_secs(60);

/// Suspect header capacity.
pub const MAX_SUSPECTS: usize = 256;

/// Structural sync failures a peer may commit inside [`STRIKE_WINDOW`]
/// before it is charged as invalid.
pub const STRUCTURAL_STRIKES: usize = 3;

pub const STRIKE_WINDOW: Duration = Duration::from_secs(60);

/// Reorgs deeper than this need corroboration.
pub const SOFT_REORG_DEPTH: u64 = 6;

/// Reorgs deeper than this trigger safe mode.
pub const HARD_REORG_DEPTH: u64 = 64;

/// Independent peers required to adopt a branch beyond the soft bound.
pub const MIN_CORROBORATING_PEERS: usize = 2;

/// Allowed drift of header timestamps into the future.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(120);

/// Required length of the policy root in headers and hello.
pub const POLICY_ROOT_LENGTH: usize = 32;

/// Largest multiplicative change of the acceptance threshold between a
/// header and its parent.
pub const MAX_THRESHOLD_STEP: f64 = 4.0;

// ---------------------------------------------------------------------------
// Flow Control
// ---------------------------------------------------------------------------

/// Receiver credit window in bytes.
pub const FLOW_WINDOW_BYTES: u64 = 512 * 1024;

/// Receiver credit window in messages.
pub const FLOW_WINDOW_MSGS: u64 = 512;

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// Dial backoff grows as `DIAL_BACKOFF_BASE ^ failures` seconds.
pub const DIAL_BACKOFF_BASE: f64 = 1.7;

/// Relative jitter applied to each backoff.
pub const DIAL_BACKOFF_JITTER: f64 = 0.25;

/// Longest dial backoff.
pub const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Addresses kept in the address book.
pub const MAX_ADDRESSES: usize = 4096;

/// A ping unanswered for this long counts as lost.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Aggregate configuration
// ---------------------------------------------------------------------------

/// Everything the service needs, in one serializable value.
///
/// The node loads this from an optional JSON file and layers CLI flags on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub handshake: HandshakeConfig,
    pub session: SessionConfig,
    pub gossip: GossipConfig,
    pub score: ScoreParams,
    pub mesh: MeshParams,
    pub rate_limit: RateLimitConfig,
    pub sync: SyncConfig,
    pub relay: RelayConfig,
    pub flow: FlowConfig,
    pub peer: PeerConfig,
}

/// Returns a human-readable name for a chain id.
pub fn chain_name(chain_id: u64) -> &'static str {
    match chain_id {
        CHAIN_ID_MAINNET => "mainnet",
        CHAIN_ID_TESTNET => "testnet",
        CHAIN_ID_DEVNET => "devnet",
        _ => "unknown",
    }
}

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_ids_are_distinct() {
        assert_ne!(CHAIN_ID_MAINNET, CHAIN_ID_TESTNET);
        assert_ne!(CHAIN_ID_TESTNET, CHAIN_ID_DEVNET);
        assert_ne!(CHAIN_ID_MAINNET, CHAIN_ID_DEVNET);
    }

    #[test]
    fn chain_name_lookup() {
        assert_eq!(chain_name(CHAIN_ID_MAINNET), "mainnet");
        assert_eq!(chain_name(CHAIN_ID_DEVNET), "devnet");
        assert_eq!(chain_name(42), "unknown");
    }

    #[test]
    fn mesh_bounds_are_ordered() {
        assert!(MESH_D_LOW <= MESH_D);
        assert!(MESH_D <= MESH_D_HIGH);
    }

    #[test]
    fn reorg_bounds_are_ordered() {
        // Safe mode must sit strictly beyond the corroboration zone.
        assert!(SOFT_REORG_DEPTH < HARD_REORG_DEPTH);
        assert!(MIN_CORROBORATING_PEERS >= 2);
    }

    #[test]
    fn header_fits_in_header_constant() {
        assert_eq!(FRAME_HEADER_LENGTH, 2 + 4 + 2 + 8 + 4);
    }

    #[test]
    fn aggregate_config_roundtrips_through_json() {
        let cfg = P2pConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: P2pConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mesh.d, cfg.mesh.d);
        assert_eq!(back.sync.hedge_fanout, cfg.sync.hedge_fanout);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let back: P2pConfig = serde_json::from_str(r#"{"sync":{"late_finalization":true}}"#).unwrap();
        assert!(back.sync.late_finalization);
        assert_eq!(back.mesh.d, MESH_D);
    }
}
