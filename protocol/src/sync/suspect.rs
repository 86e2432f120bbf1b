//! Headers that break the threshold step, held until corroborated.
//!
//! A threshold jump is either a forged header or a real change the local
//! node has not caught up with yet. Neither the header nor its sender is
//! judged on one report: the header waits here collecting distinct
//! announcers. At the quorum it is released for attaching; after the TTL
//! its announcers are handed back to be charged.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace};

use crate::types::{Hash32, PeerId};
use crate::wire::objects::BlockHeader;

struct Suspect {
    header: BlockHeader,
    announcers: HashSet<PeerId>,
    first_seen: Instant,
}

/// A held header that reached the quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corroborated {
    pub header: BlockHeader,
    /// Sorted.
    pub announcers: Vec<PeerId>,
}

/// A held header whose TTL ran out first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub hash: Hash32,
    pub announcers: Vec<PeerId>,
}

pub struct SuspectHeaders {
    held: LruCache<Hash32, Suspect>,
    quorum: usize,
    ttl: Duration,
}

impl SuspectHeaders {
    pub fn new(quorum: usize, ttl: Duration, max: usize) -> Self {
        Self {
            held: LruCache::new(NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN)),
            quorum: quorum.max(1),
            ttl,
        }
    }

    /// Record that `peer` vouches for `header`. Returns the header once
    /// `quorum` distinct peers have.
    pub fn vouch(&mut self, header: BlockHeader, peer: PeerId, now: Instant) -> Option<Corroborated> {
        let hash = header.hash();
        let count = match self.held.get_mut(&hash) {
            Some(s) => {
                s.announcers.insert(peer);
                s.announcers.len()
            }
            None => {
                let suspect = Suspect {
                    header,
                    announcers: HashSet::from([peer]),
                    first_seen: now,
                };
                if let Some((evicted, _)) = self.held.push(hash, suspect) {
                    trace!(evicted = %evicted.short(), "suspect header evicted");
                }
                1
            }
        };
        if count < self.quorum {
            trace!(header = %hash.short(), count, quorum = self.quorum, "suspect header held");
            return None;
        }
        let suspect = self.held.pop(&hash)?;
        let mut announcers: Vec<PeerId> = suspect.announcers.into_iter().collect();
        announcers.sort();
        debug!(header = %hash.short(), announcers = announcers.len(), "suspect header corroborated");
        Some(Corroborated {
            header: suspect.header,
            announcers,
        })
    }

    /// Remove headers held past the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let ttl = self.ttl;
        let stale: Vec<Hash32> = self
            .held
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.first_seen) >= ttl)
            .map(|(hash, _)| *hash)
            .collect();
        let mut out = Vec::with_capacity(stale.len());
        for hash in stale {
            if let Some(s) = self.held.pop(&hash) {
                let mut announcers: Vec<PeerId> = s.announcers.into_iter().collect();
                announcers.sort();
                out.push(Expired { hash, announcers });
            }
        }
        out
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.held.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
