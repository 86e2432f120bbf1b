//! Headers that arrived before their parent.
//!
//! Keyed by the missing parent so one arrival can release a whole chain of
//! waiters. Entries expire after a TTL; when full the oldest entry goes.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::types::{Hash32, PeerId};
use crate::wire::objects::BlockHeader;

#[derive(Debug, Clone)]
struct Orphan {
    header: BlockHeader,
    hash: Hash32,
    from: PeerId,
    received: Instant,
}

pub struct OrphanPool {
    by_parent: HashMap<Hash32, Vec<Orphan>>,
    hashes: HashSet<Hash32>,
    ttl: Duration,
    max: usize,
}

impl OrphanPool {
    pub fn new(ttl: Duration, max: usize) -> Self {
        Self {
            by_parent: HashMap::new(),
            hashes: HashSet::new(),
            ttl,
            max: max.max(1),
        }
    }

    /// Park a header. Returns `false` if it was already parked.
    pub fn insert(&mut self, header: BlockHeader, from: PeerId, now: Instant) -> bool {
        let hash = header.hash();
        if !self.hashes.insert(hash) {
            return false;
        }
        if self.hashes.len() > self.max {
            self.evict_oldest();
        }
        self.by_parent.entry(header.parent).or_default().push(Orphan {
            header,
            hash,
            from,
            received: now,
        });
        true
    }

    /// Remove and return every header waiting on `parent`.
    pub fn take_children(&mut self, parent: &Hash32) -> Vec<(BlockHeader, PeerId)> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        children
            .into_iter()
            .map(|o| {
                self.hashes.remove(&o.hash);
                (o.header, o.from)
            })
            .collect()
    }

    /// Drop entries older than the TTL. Returns how many went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut dropped = Vec::new();
        self.by_parent.retain(|_, waiting| {
            waiting.retain(|o| {
                let keep = now.saturating_duration_since(o.received) < ttl;
                if !keep {
                    dropped.push(o.hash);
                }
                keep
            });
            !waiting.is_empty()
        });
        for hash in &dropped {
            self.hashes.remove(hash);
        }
        if !dropped.is_empty() {
            trace!(expired = dropped.len(), "orphans expired");
        }
        dropped.len()
    }

    /// Drop entries that are, or wait on, any of `hashes`.
    pub fn purge(&mut self, hashes: &HashSet<Hash32>) -> usize {
        let mut dropped = Vec::new();
        self.by_parent.retain(|parent, waiting| {
            if hashes.contains(parent) {
                dropped.extend(waiting.iter().map(|o| o.hash));
                return false;
            }
            waiting.retain(|o| {
                let keep = !hashes.contains(&o.hash);
                if !keep {
                    dropped.push(o.hash);
                }
                keep
            });
            !waiting.is_empty()
        });
        for hash in &dropped {
            self.hashes.remove(hash);
        }
        dropped.len()
    }

    /// One `(parent, announcer, height)` per missing parent, for re-requests.
    pub fn missing_parents(&self) -> Vec<(Hash32, PeerId, u64)> {
        let mut out: Vec<(Hash32, PeerId, u64)> = self
            .by_parent
            .iter()
            .filter_map(|(parent, waiting)| {
                let newest = waiting.iter().max_by_key(|o| o.received)?;
                Some((*parent, newest.from, newest.header.height.saturating_sub(1)))
            })
            .collect();
        out.sort_by_key(|(_, _, h)| *h);
        out
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_parent
            .iter()
            .flat_map(|(p, waiting)| waiting.iter().map(move |o| (*p, o.hash, o.received)))
            .min_by_key(|(_, _, received)| *received);
        let Some((parent, hash, _)) = oldest else { return };
        if let Some(waiting) = self.by_parent.get_mut(&parent) {
            waiting.retain(|o| o.hash != hash);
            if waiting.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        self.hashes.remove(&hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, parent: Hash32) -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            height,
            parent,
            timestamp: height,
            threshold: 1,
            weight: 1,
            policy_root: vec![0; 32],
            body_root: Hash32::ZERO,
            nonce: 0,
        }
    }

    #[test]
    fn children_released_by_parent() {
        let now = Instant::now();
        let mut pool = OrphanPool::new(Duration::from_secs(60), 16);
        let missing = Hash32([1; 32]);
        let a = header(5, missing);
        let b = header(6, a.hash());
        assert!(pool.insert(a.clone(), PeerId([1; 32]), now));
        assert!(!pool.insert(a.clone(), PeerId([2; 32]), now));
        pool.insert(b.clone(), PeerId([1; 32]), now);
        assert_eq!(pool.missing_parents()[0], (missing, PeerId([1; 32]), 4));

        let released = pool.take_children(&missing);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, a);
        assert_eq!(pool.take_children(&a.hash()).len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn ttl_and_capacity() {
        let now = Instant::now();
        let mut pool = OrphanPool::new(Duration::from_secs(10), 2);
        pool.insert(header(1, Hash32([1; 32])), PeerId([1; 32]), now);
        pool.insert(header(2, Hash32([2; 32])), PeerId([1; 32]), now + Duration::from_secs(1));
        pool.insert(header(3, Hash32([3; 32])), PeerId([1; 32]), now + Duration::from_secs(2));
        assert_eq!(pool.len(), 2);
        assert!(pool.take_children(&Hash32([1; 32])).is_empty());

        assert_eq!(pool.expire(now + Duration::from_secs(11)), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn purge_drops_descendants_of_orphaned_blocks() {
        let now = Instant::now();
        let mut pool = OrphanPool::new(Duration::from_secs(60), 16);
        let gone = Hash32([7; 32]);
        pool.insert(header(3, gone), PeerId([1; 32]), now);
        pool.insert(header(3, Hash32([8; 32])), PeerId([1; 32]), now);
        let removed = pool.purge(&HashSet::from([gone]));
        assert_eq!(removed, 1);
        assert_eq!(pool.len(), 1);
    }
}
