//! # Rate Limiting
//!
//! Byte-denominated token buckets: one per `(peer, topic)` and one global.
//! A bucket starts full, refills continuously at `rate` bytes per second and
//! never holds more than `burst`. Over any window of length `w` a bucket
//! therefore admits at most `burst + rate·w` bytes.
//!
//! The global bucket doubles as the backpressure sensor. When its fill stays
//! below `pressure_threshold` for longer than `pressure_window`, the limiter
//! reports backpressure and non-priority topics pay twice their size from
//! the per-peer bucket until the pressure clears.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PRESSURE_WINDOW;
use crate::gossip::Topic;
use crate::types::PeerId;

// ---------------------------------------------------------------------------
// Token Bucket
// ---------------------------------------------------------------------------

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Capacity in bytes.
    pub burst: f64,
    /// Refill in bytes per second.
    pub rate: f64,
}

impl BucketSpec {
    pub const fn new(burst: f64, rate: f64) -> Self {
        Self { burst, rate }
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(spec: BucketSpec, now: Instant) -> Self {
        let capacity = spec.burst.max(0.0);
        Self {
            capacity,
            rate: spec.rate.max(0.0),
            tokens: capacity,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last = now;
        }
    }

    /// Take `cost` tokens, or report how long until that many are available.
    ///
    /// A cost above capacity can never be paid and reports `Duration::MAX`.
    pub fn try_take(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if cost <= self.tokens {
            self.tokens -= cost;
            return Ok(());
        }
        if cost > self.capacity || self.rate <= 0.0 {
            return Err(Duration::MAX);
        }
        let deficit = cost - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.rate))
    }

    /// Return tokens taken for work that was not done after all.
    pub fn refund(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }

    pub fn tokens(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Current fill in `[0, 1]`.
    pub fn fill_ratio(&mut self, now: Instant) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        self.tokens(now) / self.capacity
    }

    pub fn is_full(&mut self, now: Instant) -> bool {
        self.tokens(now) >= self.capacity
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub headers: BucketSpec,
    pub tx: BucketSpec,
    pub shares: BucketSpec,
    pub blobs: BucketSpec,
    /// Shared by every peer and topic.
    pub global: BucketSpec,
    /// Global fill ratio below which the node counts as pressured.
    pub pressure_threshold: f64,
    /// How long pressure must persist before it is reported.
    pub pressure_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            headers: BucketSpec::new(256.0 * 1024.0, 64.0 * 1024.0),
            tx: BucketSpec::new(2.0 * 1024.0 * 1024.0, 512.0 * 1024.0),
            shares: BucketSpec::new(1024.0 * 1024.0, 256.0 * 1024.0),
            blobs: BucketSpec::new(64.0 * 1024.0, 16.0 * 1024.0),
            global: BucketSpec::new(32.0 * 1024.0 * 1024.0, 8.0 * 1024.0 * 1024.0),
            pressure_threshold: 0.1,
            pressure_window_ms: PRESSURE_WINDOW.as_millis() as u64,
        }
    }
}

impl RateLimitConfig {
    pub fn spec(&self, topic: Topic) -> BucketSpec {
        match topic {
            Topic::Headers => self.headers,
            Topic::Tx => self.tx,
            Topic::Shares => self.shares,
            Topic::Blobs => self.blobs,
        }
    }

    pub fn pressure_window(&self) -> Duration {
        Duration::from_millis(self.pressure_window_ms)
    }
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

/// Result of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The peer's own bucket for this topic is empty.
    PeerLimited { retry_after: Duration },
    /// The node as a whole is over budget.
    GlobalLimited { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: DashMap<(PeerId, Topic), TokenBucket>,
    global: Mutex<TokenBucket>,
    pressure_since: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, now: Instant) -> Self {
        let global = TokenBucket::new(cfg.global, now);
        Self {
            cfg,
            buckets: DashMap::new(),
            global: Mutex::new(global),
            pressure_since: Mutex::new(None),
        }
    }

    /// Charge `bytes` to `(peer, topic)` and to the global bucket.
    pub fn admit(&self, peer: PeerId, topic: Topic, bytes: usize, now: Instant) -> Admission {
        let multiplier = if !topic.is_priority() && self.backpressure(now) {
            2.0
        } else {
            1.0
        };
        let cost = bytes as f64 * multiplier;

        let spec = self.cfg.spec(topic);
        let mut bucket = self
            .buckets
            .entry((peer, topic))
            .or_insert_with(|| TokenBucket::new(spec, now));
        if let Err(retry_after) = bucket.try_take(cost, now) {
            return Admission::PeerLimited { retry_after };
        }

        let mut global = self.global.lock();
        let result = global.try_take(bytes as f64, now);
        let fill = global.fill_ratio(now);
        drop(global);
        self.track_pressure(fill, now);

        match result {
            Ok(()) => Admission::Admitted,
            Err(retry_after) => {
                bucket.refund(cost);
                Admission::GlobalLimited { retry_after }
            }
        }
    }

    fn track_pressure(&self, fill: f64, now: Instant) {
        let mut since = self.pressure_since.lock();
        if fill < self.cfg.pressure_threshold {
            since.get_or_insert(now);
        } else {
            *since = None;
        }
    }

    /// Whether global starvation has lasted longer than the pressure window.
    pub fn backpressure(&self, now: Instant) -> bool {
        let since = *self.pressure_since.lock();
        match since {
            Some(start) => now.saturating_duration_since(start) >= self.cfg.pressure_window(),
            None => false,
        }
    }

    /// Re-sample the global bucket so pressure clears while traffic is idle.
    pub fn refresh_pressure(&self, now: Instant) {
        let fill = self.global.lock().fill_ratio(now);
        self.track_pressure(fill, now);
    }

    /// Drop buckets that have refilled completely. A fresh bucket is
    /// indistinguishable from a full one, so this loses nothing.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full(now));
        before - self.buckets.len()
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    #[test]
    fn bucket_starts_full_and_refills() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(BucketSpec::new(100.0, 10.0), t0);
        assert!(b.try_take(100.0, t0).is_ok());
        let retry = b.try_take(20.0, t0).unwrap_err();
        assert_eq!(retry, Duration::from_secs(2));
        assert!(b.try_take(20.0, t0 + Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(BucketSpec::new(50.0, 1000.0), t0);
        assert_eq!(b.tokens(t0 + Duration::from_secs(60)), 50.0);
        assert_eq!(b.try_take(51.0, t0), Err(Duration::MAX));
    }

    #[test]
    fn admitted_bytes_bounded_by_burst_plus_rate() {
        let t0 = Instant::now();
        let cfg = RateLimitConfig {
            tx: BucketSpec::new(1000.0, 100.0),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(cfg, t0);
        let mut admitted = 0usize;
        // Hammer for 10 simulated seconds in 50 ms steps.
        for step in 0..200u64 {
            let now = t0 + Duration::from_millis(step * 50);
            for _ in 0..5 {
                if limiter.admit(peer(1), Topic::Tx, 64, now).is_admitted() {
                    admitted += 64;
                }
            }
        }
        let window = 199.0 * 0.05;
        assert!(admitted as f64 <= 1000.0 + 100.0 * window);
        assert!(admitted > 1000);
    }

    #[test]
    fn peers_and_topics_have_separate_buckets() {
        let t0 = Instant::now();
        let cfg = RateLimitConfig {
            tx: BucketSpec::new(100.0, 0.0),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(cfg, t0);
        assert!(limiter.admit(peer(1), Topic::Tx, 100, t0).is_admitted());
        assert!(!limiter.admit(peer(1), Topic::Tx, 1, t0).is_admitted());
        assert!(limiter.admit(peer(2), Topic::Tx, 100, t0).is_admitted());
        assert!(limiter.admit(peer(1), Topic::Headers, 100, t0).is_admitted());
    }

    #[test]
    fn global_exhaustion_refunds_peer_and_raises_backpressure() {
        let t0 = Instant::now();
        let cfg = RateLimitConfig {
            global: BucketSpec::new(1000.0, 0.0),
            pressure_window_ms: 1000,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(cfg, t0);
        assert!(limiter.admit(peer(1), Topic::Tx, 950, t0).is_admitted());
        assert!(matches!(
            limiter.admit(peer(2), Topic::Tx, 100, t0),
            Admission::GlobalLimited { .. }
        ));
        assert!(!limiter.backpressure(t0));
        assert!(limiter.backpressure(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn backpressure_doubles_non_priority_cost() {
        let t0 = Instant::now();
        let cfg = RateLimitConfig {
            tx: BucketSpec::new(300.0, 0.0),
            headers: BucketSpec::new(300.0, 0.0),
            global: BucketSpec::new(10_000.0, 0.0),
            pressure_window_ms: 0,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(cfg, t0);
        // Drain the global bucket below the threshold from another peer.
        assert!(limiter.admit(peer(9), Topic::Blobs, 9_500, t0).is_admitted());
        assert!(limiter.backpressure(t0));

        // 150 bytes of tx costs the full 300-byte bucket.
        assert!(limiter.admit(peer(1), Topic::Tx, 150, t0).is_admitted());
        assert!(matches!(
            limiter.admit(peer(1), Topic::Tx, 1, t0),
            Admission::PeerLimited { .. }
        ));
        // Headers are priority and pay face value.
        assert!(limiter.admit(peer(1), Topic::Headers, 150, t0).is_admitted());
        assert!(limiter.admit(peer(1), Topic::Headers, 150, t0).is_admitted());
    }

    #[test]
    fn idle_full_buckets_are_pruned() {
        let t0 = Instant::now();
        let limiter = RateLimiter::new(RateLimitConfig::default(), t0);
        limiter.admit(peer(1), Topic::Headers, 10, t0);
        assert_eq!(limiter.tracked_buckets(), 1);
        assert_eq!(limiter.prune_idle(t0 + Duration::from_secs(10)), 1);
    }
}
