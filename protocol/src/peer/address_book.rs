//! Dial candidates with weights and exponential backoff.
//!
//! Weights move with experience: a successful session raises them, failed
//! dials and misbehaviour lower them. Each failure pushes the next attempt
//! out by `base^failures` seconds with ±jitter, capped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, trace};

use crate::peer::PeerConfig;
use crate::types::PeerId;

const MAX_WEIGHT: f64 = 100.0;
const MIN_WEIGHT: f64 = 0.01;

/// Where an address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrSource {
    Seed,
    Manual,
    /// Advertised by a peer during identify.
    Learned,
    /// Remote end of an inbound connection.
    Inbound,
}

impl AddrSource {
    fn initial_weight(self) -> f64 {
        match self {
            Self::Manual => 10.0,
            Self::Seed => 5.0,
            Self::Learned => 1.0,
            Self::Inbound => 0.5,
        }
    }
}

/// How a connection attempt or session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Success,
    Failure,
    Misbehavior,
}

#[derive(Debug, Clone)]
struct AddrEntry {
    source: AddrSource,
    weight: f64,
    peer: Option<PeerId>,
    failures: u32,
    next_try: Option<Instant>,
    connected: bool,
    last_seen: Instant,
}

pub struct AddressBook {
    cfg: PeerConfig,
    entries: DashMap<SocketAddr, AddrEntry>,
}

impl AddressBook {
    pub fn new(cfg: &PeerConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            entries: DashMap::new(),
        }
    }

    /// Add or refresh a candidate. `weight` overrides the source default.
    /// Returns `true` if the address was new.
    pub fn add_candidate(
        &self,
        addr: SocketAddr,
        source: AddrSource,
        weight: Option<f64>,
        now: Instant,
    ) -> bool {
        if let Some(mut e) = self.entries.get_mut(&addr) {
            e.last_seen = now;
            // Operator input outranks gossip about the same address.
            if source.initial_weight() > e.source.initial_weight() {
                e.source = source;
                e.weight = e.weight.max(weight.unwrap_or(source.initial_weight()));
            }
            return false;
        }
        if self.entries.len() >= self.cfg.max_addresses && !self.evict_weakest(source) {
            return false;
        }
        let weight = weight.unwrap_or(source.initial_weight()).clamp(MIN_WEIGHT, MAX_WEIGHT);
        self.entries.insert(
            addr,
            AddrEntry {
                source,
                weight,
                peer: None,
                failures: 0,
                next_try: None,
                connected: false,
                last_seen: now,
            },
        );
        trace!(%addr, ?source, weight, "address added");
        true
    }

    /// Drop the lowest-weight idle entry that ranks below `incoming`.
    fn evict_weakest(&self, incoming: AddrSource) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|e| !e.connected && e.source != AddrSource::Manual)
            .min_by(|a, b| a.weight.total_cmp(&b.weight))
            .map(|e| (*e.key(), e.weight));
        match victim {
            Some((addr, weight)) if weight < incoming.initial_weight() => {
                self.entries.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// Feed back how a dial or session went.
    pub fn report_outcome(
        &self,
        addr: &SocketAddr,
        outcome: DialOutcome,
        peer: Option<PeerId>,
        now: Instant,
    ) {
        let Some(mut e) = self.entries.get_mut(addr) else { return };
        if peer.is_some() {
            e.peer = peer;
        }
        e.last_seen = now;
        match outcome {
            DialOutcome::Success => {
                e.failures = 0;
                e.next_try = None;
                e.weight = (e.weight * 1.2 + 1.0).min(MAX_WEIGHT);
            }
            DialOutcome::Failure => {
                e.failures = e.failures.saturating_add(1);
                e.weight = (e.weight * 0.8).max(MIN_WEIGHT);
                e.next_try = Some(now + self.backoff(e.failures, &mut rand::thread_rng()));
                e.connected = false;
            }
            DialOutcome::Misbehavior => {
                e.failures = e.failures.saturating_add(1);
                e.weight = (e.weight * 0.25).max(MIN_WEIGHT);
                e.next_try = Some(now + self.backoff(e.failures + 2, &mut rand::thread_rng()));
                e.connected = false;
            }
        }
        debug!(%addr, ?outcome, weight = e.weight, failures = e.failures, "dial outcome");
    }

    /// `base^failures` seconds, ±jitter, capped.
    pub fn backoff<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let max = self.cfg.backoff_max().as_secs_f64();
        let raw = self.cfg.backoff_base.powi(failures.min(64) as i32).min(max);
        let jitter = self.cfg.backoff_jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((raw * factor).clamp(0.0, max))
    }

    pub fn set_connected(&self, addr: &SocketAddr, connected: bool) {
        if let Some(mut e) = self.entries.get_mut(addr) {
            e.connected = connected;
        }
    }

    /// Up to `n` addresses worth dialling now, heaviest first. `blocked`
    /// filters identities that must not be dialled, e.g. banned peers.
    pub fn dial_candidates(
        &self,
        now: Instant,
        n: usize,
        exclude: &HashSet<SocketAddr>,
        blocked: &dyn Fn(&PeerId) -> bool,
    ) -> Vec<SocketAddr> {
        let mut ready: Vec<(SocketAddr, f64)> = self
            .entries
            .iter()
            .filter(|e| !e.connected)
            .filter(|e| !exclude.contains(e.key()))
            .filter(|e| e.next_try.map_or(true, |t| t <= now))
            .filter(|e| !e.peer.as_ref().is_some_and(|p| blocked(p)))
            .map(|e| (*e.key(), e.weight))
            .collect();
        ready.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ready.into_iter().take(n).map(|(a, _)| a).collect()
    }

    pub fn weight(&self, addr: &SocketAddr) -> Option<f64> {
        self.entries.get(addr).map(|e| e.weight)
    }

    pub fn next_try(&self, addr: &SocketAddr) -> Option<Instant> {
        self.entries.get(addr).and_then(|e| e.next_try)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 30303))
    }

    fn none(_: &PeerId) -> bool {
        false
    }

    #[test]
    fn backoff_grows_with_jitter_and_cap() {
        let book = AddressBook::new(&PeerConfig::default());
        let mut rng = StdRng::seed_from_u64(7);
        for failures in 1..=20u32 {
            let d = book.backoff(failures, &mut rng).as_secs_f64();
            let nominal = 1.7f64.powi(failures as i32).min(300.0);
            assert!(d >= nominal * 0.75 - 1e-9, "{failures}: {d}");
            assert!(d <= (nominal * 1.25).min(300.0) + 1e-9, "{failures}: {d}");
        }
        assert!(book.backoff(40, &mut rng) <= Duration::from_secs(300));
    }

    #[test]
    fn candidates_ordered_by_weight_and_respect_backoff() {
        let now = Instant::now();
        let book = AddressBook::new(&PeerConfig::default());
        book.add_candidate(addr(1), AddrSource::Learned, None, now);
        book.add_candidate(addr(2), AddrSource::Seed, None, now);
        book.add_candidate(addr(3), AddrSource::Manual, None, now);
        let none_excluded = HashSet::new();
        assert_eq!(
            book.dial_candidates(now, 3, &none_excluded, &none),
            vec![addr(3), addr(2), addr(1)]
        );

        book.report_outcome(&addr(3), DialOutcome::Failure, None, now);
        let got = book.dial_candidates(now, 3, &none_excluded, &none);
        assert_eq!(got, vec![addr(2), addr(1)]);
        let later = book.next_try(&addr(3)).unwrap();
        assert!(book.dial_candidates(later, 3, &none_excluded, &none).contains(&addr(3)));

        book.report_outcome(&addr(1), DialOutcome::Success, None, now);
        assert!(book.weight(&addr(1)).unwrap() > AddrSource::Learned.initial_weight());
    }

    #[test]
    fn banned_identities_are_not_dialled() {
        let now = Instant::now();
        let book = AddressBook::new(&PeerConfig::default());
        book.add_candidate(addr(1), AddrSource::Seed, None, now);
        let bad = PeerId([9; 32]);
        book.report_outcome(&addr(1), DialOutcome::Success, Some(bad), now);
        let blocked = |p: &PeerId| *p == bad;
        assert!(book.dial_candidates(now, 1, &HashSet::new(), &blocked).is_empty());
    }

    #[test]
    fn full_book_keeps_stronger_entries() {
        let now = Instant::now();
        let cfg = PeerConfig {
            max_addresses: 2,
            ..PeerConfig::default()
        };
        let book = AddressBook::new(&cfg);
        book.add_candidate(addr(1), AddrSource::Inbound, None, now);
        book.add_candidate(addr(2), AddrSource::Seed, None, now);
        assert!(book.add_candidate(addr(3), AddrSource::Learned, None, now));
        assert_eq!(book.len(), 2);
        assert!(book.weight(&addr(1)).is_none());
        // Nothing left that ranks below an inbound address.
        assert!(!book.add_candidate(addr(4), AddrSource::Inbound, None, now));
    }
}
