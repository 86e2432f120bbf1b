//! Shared failure taxonomy.
//!
//! Each module has its own `thiserror` enum; all of them map onto one of
//! these classes so the connection loop can decide what to do without
//! matching on every variant.

use std::fmt;

/// How a failure affects the connection and the peer's standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Tear the connection down. Crypto failures, identity or chain
    /// mismatch, repeated malformed input.
    Fatal,
    /// Drop the item, keep the connection. Duplicates, precheck failures,
    /// over-quota traffic, stale references.
    Soft,
    /// The item cannot be placed yet: unknown parent, gap in a run, fetch
    /// timeout. Retried through other peers.
    Structural,
    /// The item is well formed but disagrees with local state: threshold
    /// shock, deep reorg. Held pending corroboration.
    Consistency,
}

impl Severity {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Soft => "soft",
            Self::Structural => "structural",
            Self::Consistency => "consistency",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
