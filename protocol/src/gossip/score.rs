//! # Peer Scoring
//!
//! Each peer carries one decayed scalar plus a sub-score per topic. Events
//! accumulate in counters between folds; every bucket interval `Δ` the
//! counters are folded in:
//!
//! ```text
//! score ← exp(-Δ/τ)·score + (wD·D − wI·I − wF·F + wR·R + wQ·Q + wB·B)
//! ```
//!
//! where `D` counts first deliveries, `I` invalid or oversize messages and
//! failed heavy checks, `F` flooding, `R` useful sync responses, `Q` passed
//! heavy checks and `B` seconds spent in a mesh. Pending counters already
//! count toward the peer's current value, so penalties bite immediately
//! rather than at the next fold.
//!
//! Standing is derived from the value: greylisted peers lose control-message
//! privileges, quarantined peers are not forwarded, banned peers are cut off
//! and cannot be dialed for `ban_base · 2^(offenses-1)`, capped at `ban_max`.
//! Records outlive connections so reconnecting does not launder a score.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{
    BAN_BASE, BAN_MAX, BAN_THRESHOLD, GREYLIST_THRESHOLD, MESH_HEARTBEAT, QUARANTINE_THRESHOLD,
    SCORE_DECAY_TAU,
};
use crate::gossip::Topic;
use crate::types::PeerId;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreParams {
    /// Decay time constant τ.
    pub decay_tau_ms: u64,
    /// Fold interval Δ.
    pub bucket_interval_ms: u64,
    pub w_first_delivery: f64,
    pub w_invalid: f64,
    pub w_flood: f64,
    pub w_response: f64,
    pub w_sample_pass: f64,
    /// Per second in a mesh.
    pub w_mesh_time: f64,
    /// Flood units charged for a graft attempted during backoff.
    pub graft_backoff_penalty: f64,
    /// Flood units charged for a soft sync fault.
    pub soft_fault_penalty: f64,
    /// Positive scores saturate here so old good behaviour cannot be banked.
    pub score_cap: f64,
    pub greylist_threshold: f64,
    pub quarantine_threshold: f64,
    pub ban_threshold: f64,
    pub ban_base_ms: u64,
    pub ban_max_ms: u64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            decay_tau_ms: SCORE_DECAY_TAU.as_millis() as u64,
            bucket_interval_ms: MESH_HEARTBEAT.as_millis() as u64,
            w_first_delivery: 1.0,
            w_invalid: 10.0,
            w_flood: 2.0,
            w_response: 0.5,
            w_sample_pass: 2.0,
            w_mesh_time: 0.01,
            graft_backoff_penalty: 0.5,
            soft_fault_penalty: 0.5,
            score_cap: 100.0,
            greylist_threshold: GREYLIST_THRESHOLD,
            quarantine_threshold: QUARANTINE_THRESHOLD,
            ban_threshold: BAN_THRESHOLD,
            ban_base_ms: BAN_BASE.as_millis() as u64,
            ban_max_ms: BAN_MAX.as_millis() as u64,
        }
    }
}

impl ScoreParams {
    pub fn bucket_interval(&self) -> Duration {
        Duration::from_millis(self.bucket_interval_ms)
    }

    /// Ban length for the `offenses`-th ban.
    pub fn ban_duration(&self, offenses: u32) -> Duration {
        let shift = offenses.saturating_sub(1).min(31);
        let ms = self.ban_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.ban_max_ms))
    }
}

// ---------------------------------------------------------------------------
// Events and standing
// ---------------------------------------------------------------------------

/// Something a peer did that moves its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreEvent {
    /// First valid delivery of a message.
    FirstDelivery,
    /// Failed envelope or cheap checks.
    Invalid,
    /// Frame or envelope over its size limit.
    Oversize,
    /// Over its rate quota.
    Flood,
    /// Served a useful sync response.
    Response,
    SamplePass,
    SampleFail,
    /// Graft while still inside the prune backoff.
    GraftDuringBackoff,
    /// Minor sync fault: unsolicited or premature input.
    Fault,
    /// Seconds spent as a mesh member.
    MeshTime(f64),
}

/// Coarse classification of a peer's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Standing {
    Good,
    Greylisted,
    Quarantined,
    Banned,
}

impl Standing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Greylisted => "greylisted",
            Self::Quarantined => "quarantined",
            Self::Banned => "banned",
        }
    }

    /// Graft and prune from this peer are honoured.
    pub fn accepts_control(self) -> bool {
        self == Self::Good
    }

    /// Messages from this peer are relayed onward.
    pub fn forwards(self) -> bool {
        self <= Self::Greylisted
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Counters {
    delivered: f64,
    invalid: f64,
    flood: f64,
    responses: f64,
    sampled: f64,
    mesh_secs: f64,
}

impl Counters {
    fn add(&mut self, event: ScoreEvent, params: &ScoreParams) {
        match event {
            ScoreEvent::FirstDelivery => self.delivered += 1.0,
            ScoreEvent::Invalid | ScoreEvent::Oversize | ScoreEvent::SampleFail => {
                self.invalid += 1.0
            }
            ScoreEvent::Flood => self.flood += 1.0,
            ScoreEvent::Response => self.responses += 1.0,
            ScoreEvent::SamplePass => self.sampled += 1.0,
            ScoreEvent::GraftDuringBackoff => self.flood += params.graft_backoff_penalty,
            ScoreEvent::Fault => self.flood += params.soft_fault_penalty,
            ScoreEvent::MeshTime(secs) => self.mesh_secs += secs.max(0.0),
        }
    }

    fn weighted(&self, p: &ScoreParams) -> f64 {
        p.w_first_delivery * self.delivered - p.w_invalid * self.invalid - p.w_flood * self.flood
            + p.w_response * self.responses
            + p.w_sample_pass * self.sampled
            + p.w_mesh_time * self.mesh_secs
    }
}

#[derive(Debug, Clone, Default)]
struct Component {
    score: f64,
    pending: Counters,
}

impl Component {
    fn value(&self, p: &ScoreParams) -> f64 {
        (self.score + self.pending.weighted(p)).min(p.score_cap)
    }

    fn fold(&mut self, decay: f64, p: &ScoreParams) {
        self.score = (decay * self.score + self.pending.weighted(p)).min(p.score_cap);
        self.pending = Counters::default();
    }
}

/// Score record of one peer.
#[derive(Debug, Clone)]
pub struct PeerScore {
    total: Component,
    topics: HashMap<Topic, Component>,
    last_fold: Instant,
    offenses: u32,
    banned_until: Option<Instant>,
}

impl PeerScore {
    fn new(now: Instant) -> Self {
        Self {
            total: Component::default(),
            topics: HashMap::new(),
            last_fold: now,
            offenses: 0,
            banned_until: None,
        }
    }

    pub fn value(&self, p: &ScoreParams) -> f64 {
        self.total.value(p)
    }

    pub fn topic_value(&self, topic: Topic, p: &ScoreParams) -> f64 {
        self.topics.get(&topic).map(|c| c.value(p)).unwrap_or(0.0)
    }

    pub fn offenses(&self) -> u32 {
        self.offenses
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }

    fn standing(&self, p: &ScoreParams, now: Instant) -> Standing {
        if self.is_banned(now) {
            return Standing::Banned;
        }
        let v = self.value(p);
        if v <= p.ban_threshold {
            Standing::Banned
        } else if v <= p.quarantine_threshold {
            Standing::Quarantined
        } else if v <= p.greylist_threshold {
            Standing::Greylisted
        } else {
            Standing::Good
        }
    }

    fn fold(&mut self, p: &ScoreParams, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_fold);
        if elapsed < p.bucket_interval() {
            return;
        }
        let tau = (p.decay_tau_ms as f64 / 1000.0).max(f64::EPSILON);
        let decay = (-elapsed.as_secs_f64() / tau).exp();
        self.total.fold(decay, p);
        for component in self.topics.values_mut() {
            component.fold(decay, p);
        }
        self.last_fold = now;
    }

    fn is_neutral(&self, p: &ScoreParams) -> bool {
        self.offenses == 0
            && self.value(p).abs() < 0.01
            && self.topics.values().all(|c| c.value(p).abs() < 0.01)
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Score records of every peer seen, keyed by identity.
pub struct PeerScoreTable {
    params: ScoreParams,
    peers: DashMap<PeerId, PeerScore>,
}

impl PeerScoreTable {
    pub fn new(params: ScoreParams) -> Self {
        Self {
            params,
            peers: DashMap::new(),
        }
    }

    pub fn params(&self) -> &ScoreParams {
        &self.params
    }

    /// Apply one event and return the peer's standing afterwards. Crossing
    /// the ban threshold starts a ban right here.
    pub fn record(
        &self,
        peer: PeerId,
        topic: Option<Topic>,
        event: ScoreEvent,
        now: Instant,
    ) -> Standing {
        let p = &self.params;
        let mut rec = self.peers.entry(peer).or_insert_with(|| PeerScore::new(now));
        rec.total.pending.add(event, p);
        if let Some(topic) = topic {
            rec.topics.entry(topic).or_default().pending.add(event, p);
        }

        if !rec.is_banned(now) && (*rec).value(p) <= p.ban_threshold {
            rec.offenses = rec.offenses.saturating_add(1);
            let duration = p.ban_duration(rec.offenses);
            rec.banned_until = Some(now + duration);
            // Serve the ban, then start over on probation.
            rec.total = Component {
                score: p.greylist_threshold,
                pending: Counters::default(),
            };
            rec.topics.clear();
            warn!(
                peer = %peer.short(),
                offenses = rec.offenses,
                secs = duration.as_secs(),
                "peer banned"
            );
            return Standing::Banned;
        }
        rec.standing(p, now)
    }

    /// Fold pending counters into every record whose interval has elapsed,
    /// and forget records that carry no information. Returns how many were
    /// forgotten.
    pub fn tick(&self, now: Instant) -> usize {
        let p = &self.params;
        for mut rec in self.peers.iter_mut() {
            rec.fold(p, now);
        }
        let before = self.peers.len();
        self.peers
            .retain(|_, rec| rec.is_banned(now) || !rec.is_neutral(p));
        let forgotten = before - self.peers.len();
        if forgotten > 0 {
            debug!(forgotten, "score table pruned");
        }
        forgotten
    }

    pub fn standing(&self, peer: &PeerId, now: Instant) -> Standing {
        self.peers
            .get(peer)
            .map(|rec| rec.standing(&self.params, now))
            .unwrap_or(Standing::Good)
    }

    /// Current value including pending counters. Unknown peers score zero.
    pub fn score(&self, peer: &PeerId) -> f64 {
        self.peers
            .get(peer)
            .map(|rec| (*rec).value(&self.params))
            .unwrap_or(0.0)
    }

    pub fn topic_score(&self, peer: &PeerId, topic: Topic) -> f64 {
        self.peers
            .get(peer)
            .map(|rec| rec.topic_value(topic, &self.params))
            .unwrap_or(0.0)
    }

    /// Whether a ban on `peer` is still running.
    pub fn is_dial_blocked(&self, peer: &PeerId, now: Instant) -> bool {
        self.peers.get(peer).is_some_and(|rec| rec.is_banned(now))
    }

    pub fn ban_remaining(&self, peer: &PeerId, now: Instant) -> Option<Duration> {
        let rec = self.peers.get(peer)?;
        let until = rec.banned_until?;
        (until > now).then(|| until - now)
    }

    pub fn offenses(&self, peer: &PeerId) -> u32 {
        self.peers.get(peer).map(|rec| rec.offenses()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn table() -> PeerScoreTable {
        PeerScoreTable::new(ScoreParams::default())
    }

    #[test]
    fn penalties_apply_before_the_fold() {
        let t = table();
        let now = Instant::now();
        t.record(peer(1), Some(Topic::Tx), ScoreEvent::Invalid, now);
        assert_eq!(t.score(&peer(1)), -10.0);
        assert_eq!(t.topic_score(&peer(1), Topic::Tx), -10.0);
        assert_eq!(t.topic_score(&peer(1), Topic::Headers), 0.0);
    }

    #[test]
    fn score_decays_toward_zero() {
        let t = table();
        let t0 = Instant::now();
        for _ in 0..10 {
            t.record(peer(1), None, ScoreEvent::FirstDelivery, t0);
        }
        t.tick(t0 + Duration::from_secs(1));
        let folded = t.score(&peer(1));
        assert_eq!(folded, 10.0);
        // One half-life later.
        let half = Duration::from_secs_f64(300.0 * std::f64::consts::LN_2);
        t.tick(t0 + Duration::from_secs(1) + half);
        let decayed = t.score(&peer(1));
        assert!((decayed - 5.0).abs() < 1e-6, "decayed to {decayed}");
    }

    #[test]
    fn positive_scores_are_capped() {
        let t = table();
        let now = Instant::now();
        for _ in 0..500 {
            t.record(peer(1), None, ScoreEvent::FirstDelivery, now);
        }
        assert_eq!(t.score(&peer(1)), 100.0);
    }

    #[test]
    fn standing_follows_thresholds() {
        let t = table();
        let now = Instant::now();
        assert_eq!(t.standing(&peer(1), now), Standing::Good);
        t.record(peer(1), None, ScoreEvent::Invalid, now);
        t.record(peer(1), None, ScoreEvent::Invalid, now);
        assert_eq!(t.standing(&peer(1), now), Standing::Greylisted);
        t.record(peer(1), None, ScoreEvent::Invalid, now);
        t.record(peer(1), None, ScoreEvent::Invalid, now);
        assert_eq!(t.standing(&peer(1), now), Standing::Quarantined);
        assert!(!Standing::Quarantined.forwards());
        assert!(Standing::Greylisted.forwards());
        assert!(!Standing::Greylisted.accepts_control());
    }

    #[test]
    fn ban_blocks_dialing_until_backoff_elapses() {
        let t = table();
        let now = Instant::now();
        let mut standing = Standing::Good;
        for _ in 0..8 {
            standing = t.record(peer(1), None, ScoreEvent::Invalid, now);
        }
        assert_eq!(standing, Standing::Banned);
        assert!(t.is_dial_blocked(&peer(1), now));
        assert_eq!(t.ban_remaining(&peer(1), now), Some(Duration::from_secs(60)));
        assert!(t.is_dial_blocked(&peer(1), now + Duration::from_secs(59)));
        let after = now + Duration::from_secs(61);
        assert!(!t.is_dial_blocked(&peer(1), after));
        // Probation after the ban.
        assert_eq!(t.standing(&peer(1), after), Standing::Greylisted);
    }

    #[test]
    fn repeat_offenses_double_the_ban() {
        let t = table();
        let mut now = Instant::now();
        for offense in 1..=3u32 {
            while t.record(peer(1), None, ScoreEvent::Invalid, now) != Standing::Banned {}
            assert_eq!(t.offenses(&peer(1)), offense);
            let expected = Duration::from_secs(60 * (1 << (offense - 1)));
            assert_eq!(t.ban_remaining(&peer(1), now), Some(expected));
            now += expected + Duration::from_secs(1);
        }
    }

    #[test]
    fn ban_duration_is_capped() {
        let p = ScoreParams::default();
        assert_eq!(p.ban_duration(1), Duration::from_secs(60));
        assert_eq!(p.ban_duration(40), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn neutral_records_are_forgotten() {
        let t = table();
        let now = Instant::now();
        t.record(peer(1), None, ScoreEvent::MeshTime(0.0), now);
        assert_eq!(t.len(), 1);
        t.tick(now + Duration::from_secs(2));
        assert!(t.is_empty());
    }
}
