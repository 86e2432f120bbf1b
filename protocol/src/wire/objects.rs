//! Chain objects carried inside messages.
//!
//! These are the *structural* views the transport needs: enough fields to
//! hash, link, and sanity-check. Execution semantics live elsewhere.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::crypto::hash::content_id;
use crate::types::Hash32;

const HEADER_ID_CONTEXT: &str = "tessera p2p v1 header id";
const BODY_ROOT_CONTEXT: &str = "tessera p2p v1 body root";
const TX_ID_CONTEXT: &str = "tessera p2p v1 tx id";
const SHARE_ID_CONTEXT: &str = "tessera p2p v1 share id";

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: u64,
    pub height: u64,
    pub parent: Hash32,
    /// Unix seconds.
    pub timestamp: u64,
    /// Acceptance threshold in micro-units, as set by consensus.
    pub threshold: u64,
    /// Fork-choice weight contributed by this block.
    pub weight: u64,
    #[serde(with = "serde_bytes")]
    pub policy_root: Vec<u8>,
    pub body_root: Hash32,
    pub nonce: u64,
}

impl BlockHeader {
    /// Header id. Computed over a fixed binary layout, independent of the
    /// CBOR encoding the header travelled in.
    pub fn hash(&self) -> Hash32 {
        let mut pre = Vec::with_capacity(128 + self.policy_root.len());
        pre.extend_from_slice(&self.chain_id.to_be_bytes());
        pre.extend_from_slice(&self.height.to_be_bytes());
        pre.extend_from_slice(self.parent.as_bytes());
        pre.extend_from_slice(&self.timestamp.to_be_bytes());
        pre.extend_from_slice(&self.threshold.to_be_bytes());
        pre.extend_from_slice(&self.weight.to_be_bytes());
        pre.extend_from_slice(&(self.policy_root.len() as u32).to_be_bytes());
        pre.extend_from_slice(&self.policy_root);
        pre.extend_from_slice(self.body_root.as_bytes());
        pre.extend_from_slice(&self.nonce.to_be_bytes());
        content_id(HEADER_ID_CONTEXT, &pre)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.parent.is_zero()
    }

    /// Deterministic empty genesis for `chain_id`. Nodes that share these
    /// inputs share a genesis hash.
    pub fn genesis(chain_id: u64, timestamp: u64, threshold: u64) -> Self {
        Self {
            chain_id,
            height: 0,
            parent: Hash32::ZERO,
            timestamp,
            threshold,
            weight: 1,
            policy_root: vec![0; 32],
            body_root: BlockBody::empty(Hash32::ZERO).root(),
            nonce: 0,
        }
    }
}

/// Block body as fetched by `getblocks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Hash of the header this body belongs to.
    pub header_hash: Hash32,
    pub txs: Vec<ByteBuf>,
    pub proofs: Vec<ByteBuf>,
}

impl BlockBody {
    pub fn empty(header_hash: Hash32) -> Self {
        Self {
            header_hash,
            txs: vec![],
            proofs: vec![],
        }
    }

    /// Commitment that must match `BlockHeader::body_root`.
    pub fn root(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new_derive_key(BODY_ROOT_CONTEXT);
        hasher.update(&(self.txs.len() as u32).to_be_bytes());
        for tx in &self.txs {
            hasher.update(tx_id(tx).as_bytes());
        }
        hasher.update(&(self.proofs.len() as u32).to_be_bytes());
        for proof in &self.proofs {
            hasher.update(blake3::hash(proof).as_bytes());
        }
        Hash32(*hasher.finalize().as_bytes())
    }

    /// Ids of the transactions carried by this body.
    pub fn tx_ids(&self) -> Vec<Hash32> {
        self.txs.iter().map(|tx| tx_id(tx)).collect()
    }
}

/// Transaction as relayed. Only the fields the relay gate inspects are typed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub sender: Hash32,
    pub sig_alg: u8,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Proof share envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEnvelope {
    pub type_id: u8,
    pub nullifier: Hash32,
    /// Work the share achieved, in the same micro-units as the threshold.
    pub difficulty: u64,
    /// Claimed `difficulty / threshold` in micro-units.
    pub target_ratio: u64,
    /// Unix seconds at which the prover sampled its metrics.
    pub metrics_timestamp: u64,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl ShareEnvelope {
    /// Dedup key: type id and nullifier. The body is irrelevant; two
    /// envelopes spending the same nullifier are the same share.
    pub fn share_id(&self) -> Hash32 {
        let mut pre = [0u8; 33];
        pre[0] = self.type_id;
        pre[1..].copy_from_slice(self.nullifier.as_bytes());
        content_id(SHARE_ID_CONTEXT, &pre)
    }
}

/// Data-availability blob announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobAnnouncement {
    pub commitment: Hash32,
    pub namespace: u32,
    pub size: u64,
}

/// Transaction id: hash of the raw encoded bytes as received.
pub fn tx_id(raw: &[u8]) -> Hash32 {
    content_id(TX_ID_CONTEXT, raw)
}
