//! # Dedup Window
//!
//! Rolling bloom filter of content ids seen on one topic. The window is a
//! ring of generations; inserts go to the newest one, and the oldest one is
//! dropped when a new generation opens. A generation opens when the newest
//! one fills up or grows older than the rotation interval, so an id is
//! remembered for at least one full generation and at most all of them.
//!
//! Each generation also keeps the ids it absorbed. Blooms cannot forget a
//! single member, so [`DedupWindow::invalidate`] removes the ids from the
//! logs and rebuilds the affected generations' bits from what remains. Sync
//! uses this after a reorg so that re-announced content counts as fresh.
//!
//! Filter sizing follows the usual optimum: `m = -n·ln(p) / ln(2)²` bits and
//! `k = (m/n)·ln(2)` bit positions, derived by double hashing a keyed
//! BLAKE3 of the id. The key is random per window so peers cannot aim for
//! collisions.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::gossip::GossipConfig;
use crate::types::Hash32;

/// Upper bound on a single generation's bit array.
const MAX_GENERATION_BITS: usize = 1 << 24;

/// Upper bound on bit positions per lookup.
const MAX_HASH_FUNCS: u32 = 32;

struct Generation {
    bits: Vec<u64>,
    log: Vec<Hash32>,
    started: Instant,
}

impl Generation {
    fn new(num_bits: usize, started: Instant) -> Self {
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            log: Vec::new(),
            started,
        }
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 64] |= 1u64 << (idx % 64);
    }

    fn get(&self, idx: usize) -> bool {
        self.bits[idx / 64] & (1u64 << (idx % 64)) != 0
    }
}

/// Rolling bloom filter over content ids with per-generation id logs.
pub struct DedupWindow {
    key: [u8; 32],
    num_bits: usize,
    hash_funcs: u32,
    generations: VecDeque<Generation>,
    max_generations: usize,
    items_per_generation: usize,
    rotate_interval: Duration,
}

impl DedupWindow {
    pub fn new(
        max_generations: usize,
        items_per_generation: usize,
        rotate_interval: Duration,
        fp_rate: f64,
        now: Instant,
    ) -> Self {
        let n = items_per_generation.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)) as usize;
        let num_bits = num_bits.clamp(64, MAX_GENERATION_BITS);
        let hash_funcs = ((num_bits as f64 / n) * ln2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_HASH_FUNCS);

        let mut generations = VecDeque::with_capacity(max_generations.max(1));
        generations.push_front(Generation::new(num_bits, now));

        Self {
            key: rand::random(),
            num_bits,
            hash_funcs,
            generations,
            max_generations: max_generations.max(1),
            items_per_generation: items_per_generation.max(1),
            rotate_interval,
        }
    }

    pub fn from_config(cfg: &GossipConfig, now: Instant) -> Self {
        Self::new(
            cfg.dedup_generations,
            cfg.dedup_items_per_generation,
            cfg.dedup_rotate_interval(),
            cfg.dedup_fp_rate,
            now,
        )
    }

    fn positions(&self, id: &Hash32) -> impl Iterator<Item = usize> {
        let digest = blake3::keyed_hash(&self.key, id.as_bytes());
        let bytes = digest.as_bytes();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        b.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(a);
        // Odd stride so successive positions never collapse onto one slot.
        let h2 = u64::from_le_bytes(b) | 1;
        let m = self.num_bits as u64;
        (0..self.hash_funcs as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    fn in_generation(&self, gen: &Generation, id: &Hash32) -> bool {
        self.positions(id).all(|idx| gen.get(idx))
    }

    /// Whether `id` may have been seen. False positives at the configured
    /// rate; no false negatives for ids still inside the window.
    pub fn contains(&self, id: &Hash32) -> bool {
        self.generations.iter().any(|g| self.in_generation(g, id))
    }

    /// Insert `id` unless already present. Returns `true` if it was fresh.
    pub fn check_and_insert(&mut self, id: Hash32, now: Instant) -> bool {
        self.maybe_rotate(now);
        if self.contains(&id) {
            return false;
        }
        let positions: Vec<usize> = self.positions(&id).collect();
        let full = {
            let Some(newest) = self.generations.front_mut() else {
                return false;
            };
            for idx in positions {
                newest.set(idx);
            }
            newest.log.push(id);
            newest.log.len() >= self.items_per_generation
        };
        if full {
            self.rotate(now);
        }
        true
    }

    /// Open a fresh generation, dropping the oldest beyond capacity.
    pub fn rotate(&mut self, now: Instant) {
        self.generations.push_front(Generation::new(self.num_bits, now));
        while self.generations.len() > self.max_generations {
            self.generations.pop_back();
        }
    }

    /// Rotate if the newest generation has outlived the interval.
    pub fn maybe_rotate(&mut self, now: Instant) -> bool {
        let expired = self
            .generations
            .front()
            .map(|g| now.saturating_duration_since(g.started) >= self.rotate_interval)
            .unwrap_or(true);
        if expired {
            self.rotate(now);
        }
        expired
    }

    /// Forget `ids`. Returns how many were actually present in a log.
    pub fn invalidate(&mut self, ids: &[Hash32]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let targets: HashSet<&Hash32> = ids.iter().collect();
        let mut removed = 0;
        let mut dirty = Vec::new();
        for (i, gen) in self.generations.iter_mut().enumerate() {
            let before = gen.log.len();
            gen.log.retain(|id| !targets.contains(id));
            if gen.log.len() != before {
                removed += before - gen.log.len();
                dirty.push(i);
            }
        }
        for i in dirty {
            self.rebuild(i);
        }
        removed
    }

    fn rebuild(&mut self, index: usize) {
        let Some(gen) = self.generations.get(index) else {
            return;
        };
        let log = gen.log.clone();
        let mut bits = vec![0u64; self.num_bits.div_ceil(64)];
        for id in &log {
            for idx in self.positions(id) {
                bits[idx / 64] |= 1u64 << (idx % 64);
            }
        }
        if let Some(gen) = self.generations.get_mut(index) {
            gen.bits = bits;
        }
    }

    /// Ids currently logged across all generations.
    pub fn len(&self) -> usize {
        self.generations.iter().map(|g| g.log.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generations(&self) -> usize {
        self.generations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> Hash32 {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        Hash32(blake3::hash(&bytes).into())
    }

    fn window(now: Instant) -> DedupWindow {
        DedupWindow::new(3, 100, Duration::from_secs(60), 0.0001, now)
    }

    #[test]
    fn second_insert_is_a_duplicate() {
        let now = Instant::now();
        let mut w = window(now);
        assert!(w.check_and_insert(id(1), now));
        assert!(!w.check_and_insert(id(1), now));
        assert!(w.contains(&id(1)));
        assert!(!w.contains(&id(2)));
    }

    #[test]
    fn count_rotation_forgets_after_all_generations() {
        let now = Instant::now();
        let mut w = window(now);
        w.check_and_insert(id(0), now);
        // Fill three generations' worth of other ids.
        for n in 1..=300 {
            w.check_and_insert(id(n), now);
        }
        assert!(w.generations() <= 3);
        assert!(!w.contains(&id(0)));
        assert!(w.contains(&id(300)));
    }

    #[test]
    fn time_rotation_keeps_recent_generations() {
        let start = Instant::now();
        let mut w = window(start);
        w.check_and_insert(id(7), start);
        let later = start + Duration::from_secs(61);
        assert!(w.maybe_rotate(later));
        assert!(w.contains(&id(7)));
        w.maybe_rotate(later + Duration::from_secs(61));
        w.maybe_rotate(later + Duration::from_secs(122));
        assert!(!w.contains(&id(7)));
    }

    #[test]
    fn invalidate_makes_content_fresh_again() {
        let now = Instant::now();
        let mut w = window(now);
        for n in 0..20 {
            w.check_and_insert(id(n), now);
        }
        assert_eq!(w.invalidate(&[id(3), id(4), id(999)]), 2);
        assert!(!w.contains(&id(3)));
        assert!(w.contains(&id(5)));
        assert!(w.check_and_insert(id(3), now));
        assert_eq!(w.len(), 19);
    }
}
