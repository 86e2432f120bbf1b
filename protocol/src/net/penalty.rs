//! What a rejected sync input costs its sender.
//!
//! | severity    | sanction                                              |
//! |-------------|-------------------------------------------------------|
//! | soft        | small score charge                                    |
//! | structural  | a strike; the `limit`-th inside the window is invalid |
//! | consistency | invalid (only reached once corroboration timed out)   |
//! | fatal       | invalid and disconnect                                |
//!
//! Structural failures are usually honest: a peer on another branch or a
//! body that raced a reorg. Only a run of them inside the window costs
//! score.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::Severity;
use crate::gossip::ScoreEvent;
use crate::types::PeerId;

/// Outcome of [`PenaltyPolicy::judge`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sanction {
    None,
    Charge(ScoreEvent),
    /// Charge as invalid and close the connection.
    Disconnect,
}

pub struct PenaltyPolicy {
    strikes: HashMap<PeerId, VecDeque<Instant>>,
    limit: usize,
    window: Duration,
}

impl PenaltyPolicy {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            strikes: HashMap::new(),
            limit: limit.max(1),
            window,
        }
    }

    pub fn judge(&mut self, peer: PeerId, severity: Severity, now: Instant) -> Sanction {
        match severity {
            Severity::Soft => Sanction::Charge(ScoreEvent::Fault),
            Severity::Structural => {
                let window = self.window;
                let strikes = self.strikes.entry(peer).or_default();
                while strikes
                    .front()
                    .is_some_and(|at| now.saturating_duration_since(*at) >= window)
                {
                    strikes.pop_front();
                }
                strikes.push_back(now);
                if strikes.len() >= self.limit {
                    strikes.clear();
                    Sanction::Charge(ScoreEvent::Invalid)
                } else {
                    Sanction::None
                }
            }
            Severity::Consistency => Sanction::Charge(ScoreEvent::Invalid),
            Severity::Fatal => Sanction::Disconnect,
        }
    }

    /// Strikes currently counted against `peer`.
    pub fn strikes(&self, peer: &PeerId) -> usize {
        self.strikes.get(peer).map_or(0, VecDeque::len)
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.strikes.remove(peer);
    }
}
