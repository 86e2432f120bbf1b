//! Narrow interfaces between sync and its neighbours.
//!
//! Sync publishes a read-only [`ChainView`] that gossip consults; consensus
//! and storage are consumed through [`ConsensusView`] and [`BlockSource`].
//! Simple in-memory implementations live here too, for the node binary and
//! for tests.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::Hash32;
use crate::wire::objects::{BlockBody, BlockHeader};

/// Best tip as seen by fork choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadInfo {
    pub hash: Hash32,
    pub height: u64,
    pub total_weight: u128,
}

/// Read-only view of the header frontier.
pub trait ChainView: Send + Sync {
    fn head(&self) -> HeadInfo;

    /// Whether a header with this hash is attached to the frontier.
    fn contains(&self, hash: &Hash32) -> bool;

    fn header(&self, hash: &Hash32) -> Option<BlockHeader>;

    fn has_body(&self, hash: &Hash32) -> bool;

    /// Whether the header lies on the current best chain.
    fn is_canonical(&self, hash: &Hash32) -> bool;

    fn in_safe_mode(&self) -> bool;
}

/// What sync needs from consensus. The acceptance predicate itself stays
/// on the other side of this trait.
pub trait ConsensusView: Send + Sync {
    /// Threshold in force at the current head, in micro-units.
    fn current_threshold(&self) -> u64;

    /// Commitment to the active algorithm policy.
    fn policy_root(&self) -> Hash32;

    /// Structural pre-acceptance of a body. `Err` carries a reason.
    fn preview_body(&self, header: &BlockHeader, body: &BlockBody) -> Result<(), String>;
}

/// Storage adapter used to answer `getblocks`.
pub trait BlockSource: Send + Sync {
    fn body(&self, hash: &Hash32) -> Option<BlockBody>;
}

/// Consensus stand-in with a fixed threshold and policy root.
#[derive(Debug, Clone)]
pub struct FixedConsensus {
    pub threshold: u64,
    pub policy_root: Hash32,
}

impl FixedConsensus {
    pub fn new(threshold: u64, policy_root: Hash32) -> Self {
        Self {
            threshold,
            policy_root,
        }
    }
}

impl ConsensusView for FixedConsensus {
    fn current_threshold(&self) -> u64 {
        self.threshold
    }

    fn policy_root(&self) -> Hash32 {
        self.policy_root
    }

    fn preview_body(&self, header: &BlockHeader, body: &BlockBody) -> Result<(), String> {
        if body.txs.len() < body.proofs.len() {
            return Err(format!(
                "block {} carries more proofs than transactions",
                header.height
            ));
        }
        Ok(())
    }
}

/// Bodies kept in memory, keyed by header hash.
#[derive(Default)]
pub struct MemoryBlockSource {
    bodies: RwLock<HashMap<Hash32, BlockBody>>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, body: BlockBody) {
        self.bodies.write().insert(body.header_hash, body);
    }

    pub fn len(&self) -> usize {
        self.bodies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.read().is_empty()
    }
}

impl BlockSource for MemoryBlockSource {
    fn body(&self, hash: &Hash32) -> Option<BlockBody> {
        self.bodies.read().get(hash).cloned()
    }
}
