//! Header checks and block locators.
//!
//! Everything here is a pure function of the header, its parent and a few
//! local numbers. Whether the parent is *known* is the frontier's business.

use thiserror::Error;

use crate::config::{
    LOCATOR_DENSE_ENTRIES, LOCATOR_MAX_ENTRIES, MAX_THRESHOLD_STEP, POLICY_ROOT_LENGTH,
};
use crate::error::Severity;
use crate::types::Hash32;
use crate::wire::objects::BlockHeader;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("{count} headers in one message, limit {max}")]
    TooMany { count: usize, max: usize },

    #[error("chain id mismatch: expected {expected:#x}, got {got:#x}")]
    ChainMismatch { expected: u64, got: u64 },

    #[error("header {index} does not extend its predecessor")]
    NotContiguous { index: usize },

    #[error("unknown parent {0}")]
    UnknownParent(Hash32),

    #[error("height {got} does not follow parent height (expected {expected})")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("timestamp {timestamp} is ahead of local clock {now}")]
    ClockSkew { timestamp: u64, now: u64 },

    #[error("timestamp {timestamp} is before parent timestamp {parent}")]
    TimestampRegression { timestamp: u64, parent: u64 },

    #[error("threshold {got} moved too far from parent threshold {parent}")]
    ThresholdStep { parent: u64, got: u64 },

    #[error("policy root is {0} bytes")]
    PolicyRootLength(usize),

    #[error("policy root {got} differs from local {expected}")]
    PolicyMismatch { expected: Hash32, got: Hash32 },
}

impl HeaderError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::NotContiguous { .. } | Self::UnknownParent(_) | Self::HeightMismatch { .. } => {
                Severity::Structural
            }
            Self::ThresholdStep { .. } => Severity::Consistency,
            _ => Severity::Soft,
        }
    }
}

/// Local numbers a header is judged against.
#[derive(Debug, Clone, Copy)]
pub struct HeaderRules {
    pub chain_id: u64,
    /// Policy root every non-genesis header must commit to.
    pub policy_root: Hash32,
    pub max_clock_skew_secs: u64,
    pub now_unix: u64,
}

/// Checks that need nothing but the header.
pub fn check_standalone(header: &BlockHeader, rules: &HeaderRules) -> Result<(), HeaderError> {
    if header.chain_id != rules.chain_id {
        return Err(HeaderError::ChainMismatch {
            expected: rules.chain_id,
            got: header.chain_id,
        });
    }
    if header.policy_root.len() != POLICY_ROOT_LENGTH {
        return Err(HeaderError::PolicyRootLength(header.policy_root.len()));
    }
    let mut root = [0u8; 32];
    root.copy_from_slice(&header.policy_root);
    if !header.is_genesis() && root != *rules.policy_root.as_bytes() {
        return Err(HeaderError::PolicyMismatch {
            expected: rules.policy_root,
            got: Hash32(root),
        });
    }
    if header.timestamp > rules.now_unix.saturating_add(rules.max_clock_skew_secs) {
        return Err(HeaderError::ClockSkew {
            timestamp: header.timestamp,
            now: rules.now_unix,
        });
    }
    Ok(())
}

/// Linkage, timestamp and threshold step against the parent.
pub fn check_against_parent(
    header: &BlockHeader,
    parent: &BlockHeader,
    rules: &HeaderRules,
) -> Result<(), HeaderError> {
    let parent_hash = parent.hash();
    if header.parent != parent_hash {
        return Err(HeaderError::UnknownParent(header.parent));
    }
    if header.height != parent.height + 1 {
        return Err(HeaderError::HeightMismatch {
            expected: parent.height + 1,
            got: header.height,
        });
    }
    if header.timestamp < parent.timestamp.saturating_sub(rules.max_clock_skew_secs) {
        return Err(HeaderError::TimestampRegression {
            timestamp: header.timestamp,
            parent: parent.timestamp,
        });
    }
    if !threshold_step_ok(parent.threshold, header.threshold) {
        return Err(HeaderError::ThresholdStep {
            parent: parent.threshold,
            got: header.threshold,
        });
    }
    Ok(())
}

/// Whether `next` stays within the multiplicative step bound of `prev`.
pub fn threshold_step_ok(prev: u64, next: u64) -> bool {
    if prev == 0 {
        return true;
    }
    let ratio = next as f64 / prev as f64;
    (1.0 / MAX_THRESHOLD_STEP..=MAX_THRESHOLD_STEP).contains(&ratio)
}

/// A `headers` payload must be one contiguous run.
pub fn check_contiguous(headers: &[BlockHeader]) -> Result<(), HeaderError> {
    for (index, pair) in headers.windows(2).enumerate() {
        if pair[1].parent != pair[0].hash() || pair[1].height != pair[0].height + 1 {
            return Err(HeaderError::NotContiguous { index: index + 1 });
        }
    }
    Ok(())
}

/// Heights a locator samples from a tip: the ten most recent one by one,
/// then doubling steps, genesis always last.
pub fn locator_heights(tip: u64) -> Vec<u64> {
    let mut heights = Vec::with_capacity(LOCATOR_MAX_ENTRIES);
    let mut height = tip;
    let mut step = 1u64;
    while height > 0 && heights.len() < LOCATOR_MAX_ENTRIES - 1 {
        heights.push(height);
        if heights.len() >= LOCATOR_DENSE_ENTRIES {
            step = step.saturating_mul(2);
        }
        height = height.saturating_sub(step);
    }
    heights.push(0);
    heights
}
