//! Round-trip estimation from ping/pong, RFC 6298 style.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks outstanding pings for one connection.
#[derive(Debug, Default)]
pub struct PingTracker {
    pending: HashMap<u64, Instant>,
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
    last: Option<Duration>,
    sent: u64,
    lost: u64,
    /// Pings written off since the last pong.
    streak: u32,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ping and return its nonce.
    pub fn start(&mut self, now: Instant) -> u64 {
        let mut nonce: u64 = rand::random();
        while self.pending.contains_key(&nonce) {
            nonce = rand::random();
        }
        self.pending.insert(nonce, now);
        self.sent += 1;
        nonce
    }

    /// A pong arrived. Returns the sample, or `None` for a nonce we never
    /// sent (or already wrote off).
    pub fn on_pong(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        let sent = self.pending.remove(&nonce)?;
        let rtt = now.saturating_duration_since(sent);
        self.streak = 0;
        self.observe(rtt);
        Some(rtt)
    }

    fn observe(&mut self, rtt: Duration) {
        self.last = Some(rtt);
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let err = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = Some(rttvar.mul_f64(0.75) + err.mul_f64(0.25));
                self.srtt = Some(srtt.mul_f64(0.875) + rtt.mul_f64(0.125));
            }
            _ => {
                self.srtt = Some(rtt);
                self.rttvar = Some(rtt / 2);
            }
        }
    }

    /// Write off pings older than `timeout`. Returns how many were lost.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, sent| now.saturating_duration_since(*sent) < timeout);
        let lost = before - self.pending.len();
        self.lost += lost as u64;
        self.streak = self.streak.saturating_add(lost as u32);
        lost
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    /// `srtt + 4 * rttvar`.
    pub fn rto(&self) -> Option<Duration> {
        Some(self.srtt? + self.rttvar? * 4)
    }

    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }

    pub fn consecutive_lost(&self) -> u32 {
        self.streak
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothed_rtt_follows_rfc6298() {
        let t0 = Instant::now();
        let mut p = PingTracker::new();
        let n = p.start(t0);
        assert_eq!(p.on_pong(n, t0 + Duration::from_millis(100)), Some(Duration::from_millis(100)));
        assert_eq!(p.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(p.rto(), Some(Duration::from_millis(300)));

        let n = p.start(t0);
        p.on_pong(n, t0 + Duration::from_millis(200));
        // 7/8 * 100 + 1/8 * 200
        assert_eq!(p.srtt().unwrap().as_millis(), 112);
        assert!(p.on_pong(n, t0).is_none());
    }

    #[test]
    fn unanswered_pings_count_as_loss() {
        let t0 = Instant::now();
        let mut p = PingTracker::new();
        p.start(t0);
        let n = p.start(t0);
        p.on_pong(n, t0 + Duration::from_millis(10));
        assert_eq!(p.expire(t0 + Duration::from_secs(6), Duration::from_secs(5)), 1);
        assert_eq!(p.loss_rate(), 0.5);
        assert_eq!(p.outstanding(), 0);
        assert_eq!(p.consecutive_lost(), 1);

        let n = p.start(t0);
        p.on_pong(n, t0 + Duration::from_millis(10));
        assert_eq!(p.consecutive_lost(), 0);
    }
}
