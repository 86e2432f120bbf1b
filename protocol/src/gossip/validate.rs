//! Topic decoding and cheap checks (pipeline stages 3 and 4).
//!
//! Decoding yields the object and its content id, which is what the dedup
//! window is keyed on. The cheap checks then look only at the object itself
//! and a handful of numbers from the local view: chain id, current
//! threshold, wall clock. Nothing here touches state or verifies a proof.

use crate::crypto::SignatureAlg;
use crate::gossip::{GossipConfig, GossipReject, Topic};
use crate::config::{MAX_THRESHOLD_STEP, POLICY_ROOT_LENGTH};
use crate::types::Hash32;
use crate::wire::messages::ids;
use crate::wire::objects::{tx_id, BlobAnnouncement, BlockHeader, ShareEnvelope, TxEnvelope};
use crate::wire::{from_canonical_cbor, WireError};

/// A decoded gossip payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipObject {
    Header(BlockHeader),
    Tx(TxEnvelope),
    Share(ShareEnvelope),
    Blob(BlobAnnouncement),
}

impl GossipObject {
    /// Decode `data` as the topic's object. Payloads must be canonical CBOR
    /// so every node derives the same content id.
    pub fn decode(topic: Topic, data: &[u8]) -> Result<Self, GossipReject> {
        let malformed = |e: WireError| GossipReject::Malformed {
            topic,
            reason: e.to_string(),
        };
        Ok(match topic {
            Topic::Headers => {
                Self::Header(from_canonical_cbor(ids::GOSSIP, data).map_err(malformed)?)
            }
            Topic::Tx => Self::Tx(from_canonical_cbor(ids::GOSSIP, data).map_err(malformed)?),
            Topic::Shares => {
                Self::Share(from_canonical_cbor(ids::GOSSIP, data).map_err(malformed)?)
            }
            Topic::Blobs => Self::Blob(from_canonical_cbor(ids::GOSSIP, data).map_err(malformed)?),
        })
    }

    pub fn topic(&self) -> Topic {
        match self {
            Self::Header(_) => Topic::Headers,
            Self::Tx(_) => Topic::Tx,
            Self::Share(_) => Topic::Shares,
            Self::Blob(_) => Topic::Blobs,
        }
    }

    /// Dedup key: header hash, tx hash, share nullifier id, blob commitment.
    pub fn content_id(&self, raw: &[u8]) -> Hash32 {
        match self {
            Self::Header(h) => h.hash(),
            Self::Tx(_) => tx_id(raw),
            Self::Share(s) => s.share_id(),
            Self::Blob(b) => b.commitment,
        }
    }
}

/// Local numbers the cheap checks compare against.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub cfg: &'a GossipConfig,
    pub chain_id: u64,
    /// Current acceptance threshold in micro-units. Zero disables the
    /// threshold-relative checks.
    pub threshold: u64,
    /// Policy root headers must commit to. `None` skips the comparison.
    pub policy_root: Option<Hash32>,
    /// Local wall clock, Unix seconds.
    pub now_unix: u64,
}

pub fn cheap_check(object: &GossipObject, ctx: &CheckContext<'_>) -> Result<(), GossipReject> {
    match object {
        GossipObject::Header(h) => check_header(h, ctx),
        GossipObject::Tx(tx) => check_tx(tx, ctx),
        GossipObject::Share(s) => check_share(s, ctx),
        GossipObject::Blob(b) => check_blob(b, ctx),
    }
}

pub fn check_header(header: &BlockHeader, ctx: &CheckContext<'_>) -> Result<(), GossipReject> {
    if header.chain_id != ctx.chain_id {
        return Err(GossipReject::ChainMismatch {
            expected: ctx.chain_id,
            got: header.chain_id,
        });
    }
    if header.policy_root.len() != POLICY_ROOT_LENGTH {
        return Err(GossipReject::PolicyRootLength);
    }
    if let Some(expected) = ctx.policy_root {
        if header.policy_root.as_slice() != expected.as_bytes().as_slice() {
            return Err(GossipReject::PolicyMismatch);
        }
    }
    let skew = ctx.cfg.max_clock_skew().as_secs();
    if header.timestamp > ctx.now_unix.saturating_add(skew) {
        return Err(GossipReject::ClockSkew {
            timestamp: header.timestamp,
            now: ctx.now_unix,
        });
    }
    if ctx.threshold > 0 {
        let ratio = header.threshold as f64 / ctx.threshold as f64;
        if !(1.0 / MAX_THRESHOLD_STEP..=MAX_THRESHOLD_STEP).contains(&ratio) {
            return Err(GossipReject::ThresholdShock {
                current: ctx.threshold,
                got: header.threshold,
            });
        }
    }
    Ok(())
}

pub fn check_tx(tx: &TxEnvelope, ctx: &CheckContext<'_>) -> Result<(), GossipReject> {
    if tx.chain_id != ctx.chain_id {
        return Err(GossipReject::ChainMismatch {
            expected: ctx.chain_id,
            got: tx.chain_id,
        });
    }
    let alg = SignatureAlg::from_byte(tx.sig_alg).map_err(|_| GossipReject::SignatureShape)?;
    if tx.signature.len() != alg.signature_len() || tx.sender.is_zero() {
        return Err(GossipReject::SignatureShape);
    }
    Ok(())
}

pub fn check_share(share: &ShareEnvelope, ctx: &CheckContext<'_>) -> Result<(), GossipReject> {
    let cfg = ctx.cfg;
    if !cfg.allowed_share_types.contains(&share.type_id) {
        return Err(GossipReject::ShareType(share.type_id));
    }
    if share.nullifier.is_zero() {
        return Err(GossipReject::ZeroNullifier);
    }

    let skew = cfg.max_clock_skew().as_secs();
    if share.metrics_timestamp > ctx.now_unix.saturating_add(skew) {
        return Err(GossipReject::ClockSkew {
            timestamp: share.metrics_timestamp,
            now: ctx.now_unix,
        });
    }
    let age = ctx.now_unix.saturating_sub(share.metrics_timestamp);
    if age > cfg.share_max_age().as_secs() {
        return Err(GossipReject::StaleMetrics { age_secs: age });
    }

    if ctx.threshold > 0 {
        let recomputed = share_ratio(share.difficulty, ctx.threshold);
        let claimed = share.target_ratio;
        let diff = recomputed.abs_diff(claimed) as u128;
        let tolerance = recomputed as u128 * cfg.share_ratio_tolerance_ppm as u128 / 1_000_000;
        if recomputed < cfg.min_share_ratio || diff > tolerance {
            return Err(GossipReject::ShareRatio {
                claimed,
                recomputed,
            });
        }
    }
    Ok(())
}

/// `difficulty / threshold` in micro-units, saturating.
pub fn share_ratio(difficulty: u64, threshold: u64) -> u64 {
    if threshold == 0 {
        return u64::MAX;
    }
    let ratio = difficulty as u128 * 1_000_000 / threshold as u128;
    ratio.min(u64::MAX as u128) as u64
}

pub fn check_blob(blob: &BlobAnnouncement, ctx: &CheckContext<'_>) -> Result<(), GossipReject> {
    if blob.commitment.is_zero() {
        return Err(GossipReject::BadBlob("zero commitment"));
    }
    if blob.size == 0 {
        return Err(GossipReject::BadBlob("empty blob"));
    }
    if blob.size > ctx.cfg.max_blob_bytes {
        return Err(GossipReject::BadBlob("blob too large"));
    }
    Ok(())
}
