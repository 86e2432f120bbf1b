//! # Hedged Body Fetch
//!
//! Bodies are fetched lowest height first. Each body is asked of up to
//! `hedge_fanout` announcers at once, best-scoring first; the first valid
//! arrival settles the body and cancels its group token, which tells the
//! network layer to drop hedged copies not yet on the wire.
//!
//! Every request also gets its own child token. A timeout cancels only that
//! request; the body goes back in the queue for an untried announcer until
//! `max_fetch_attempts` rounds have passed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::sync::SyncConfig;
use crate::types::{Hash32, PeerId};
use crate::wire::messages::{GetBlocks, Message};

/// One `getblocks` to send.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: u64,
    pub peer: PeerId,
    /// Requested hashes, each with the token that retires it.
    pub items: Vec<(Hash32, CancellationToken)>,
}

impl FetchRequest {
    /// Hashes nobody has delivered yet.
    pub fn live_hashes(&self) -> Vec<Hash32> {
        self.items
            .iter()
            .filter(|(_, t)| !t.is_cancelled())
            .map(|(h, _)| *h)
            .collect()
    }

    /// The `getblocks` for the live hashes, or `None` if all are settled.
    pub fn to_message(&self) -> Option<Message> {
        let hashes = self.live_hashes();
        (!hashes.is_empty()).then(|| Message::GetBlocks(GetBlocks { hashes }))
    }

    /// Resolves once every item is settled or timed out.
    pub async fn settled(&self) {
        futures::future::join_all(self.items.iter().map(|(_, t)| t.cancelled())).await;
    }
}

#[derive(Debug)]
struct Group {
    height: u64,
    token: CancellationToken,
    /// Peer to the request id it is riding in.
    outstanding: HashMap<PeerId, u64>,
    tried: HashSet<PeerId>,
    attempts: u32,
}

#[derive(Debug)]
struct Outstanding {
    peer: PeerId,
    items: HashMap<Hash32, CancellationToken>,
    deadline: Instant,
}

/// What `expire` found.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// `(peer, hash)` pairs whose request ran out of time.
    pub timed_out: Vec<(PeerId, Hash32)>,
    /// Bodies given up on after too many rounds.
    pub abandoned: Vec<Hash32>,
}

pub struct BodyFetcher {
    hedge_fanout: usize,
    batch: usize,
    timeout: Duration,
    max_attempts: u32,
    queue: BTreeSet<(u64, Hash32)>,
    groups: HashMap<Hash32, Group>,
    candidates: HashMap<Hash32, HashSet<PeerId>>,
    requests: HashMap<u64, Outstanding>,
    per_peer: HashMap<PeerId, usize>,
    next_id: u64,
}

impl BodyFetcher {
    pub fn new(cfg: &SyncConfig) -> Self {
        Self {
            hedge_fanout: cfg.hedge_fanout.max(1),
            batch: cfg.max_blocks_per_request.max(1),
            timeout: cfg.fetch_timeout(),
            max_attempts: cfg.max_fetch_attempts.max(1),
            queue: BTreeSet::new(),
            groups: HashMap::new(),
            candidates: HashMap::new(),
            requests: HashMap::new(),
            per_peer: HashMap::new(),
            next_id: 0,
        }
    }

    /// Queue a body. Known bodies only gain candidates.
    pub fn enqueue(
        &mut self,
        hash: Hash32,
        height: u64,
        announcers: impl IntoIterator<Item = PeerId>,
    ) {
        self.candidates.entry(hash).or_default().extend(announcers);
        if self.groups.contains_key(&hash) {
            return;
        }
        self.groups.insert(
            hash,
            Group {
                height,
                token: CancellationToken::new(),
                outstanding: HashMap::new(),
                tried: HashSet::new(),
                attempts: 0,
            },
        );
        self.queue.insert((height, hash));
    }

    pub fn add_candidate(&mut self, hash: Hash32, peer: PeerId) {
        if self.groups.contains_key(&hash) {
            self.candidates.entry(hash).or_default().insert(peer);
        }
    }

    /// Hand out queued bodies to untried candidates, at most `per_peer_limit`
    /// outstanding per peer.
    pub fn schedule(
        &mut self,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
        per_peer_limit: usize,
    ) -> Vec<FetchRequest> {
        let mut batches: HashMap<PeerId, Vec<Hash32>> = HashMap::new();
        let mut scheduled = Vec::new();

        for &(height, hash) in &self.queue {
            let Some(group) = self.groups.get(&hash) else { continue };
            let mut peers: Vec<PeerId> = self
                .candidates
                .get(&hash)
                .map(|c| {
                    c.iter()
                        .filter(|p| {
                            !group.tried.contains(*p) && !group.outstanding.contains_key(*p)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default();
            peers.sort_by(|a, b| score(b).total_cmp(&score(a)).then(a.cmp(b)));

            let want = self.hedge_fanout.saturating_sub(group.outstanding.len());
            let mut chosen = Vec::new();
            for peer in peers {
                if chosen.len() >= want {
                    break;
                }
                let load = self.per_peer.get(&peer).copied().unwrap_or(0)
                    + batches.get(&peer).map_or(0, Vec::len);
                if load < per_peer_limit {
                    chosen.push(peer);
                }
            }
            if chosen.is_empty() {
                continue;
            }
            for peer in chosen {
                batches.entry(peer).or_default().push(hash);
            }
            scheduled.push((height, hash));
        }

        for key in &scheduled {
            self.queue.remove(key);
            if let Some(group) = self.groups.get_mut(&key.1) {
                group.attempts += 1;
            }
        }

        let mut out = Vec::new();
        let mut peers: Vec<PeerId> = batches.keys().copied().collect();
        peers.sort();
        for peer in peers {
            let Some(hashes) = batches.remove(&peer) else { continue };
            for chunk in hashes.chunks(self.batch) {
                out.push(self.open_request(peer, chunk, now));
            }
        }
        if !out.is_empty() {
            trace!(requests = out.len(), bodies = scheduled.len(), "body fetch scheduled");
        }
        out
    }

    fn open_request(&mut self, peer: PeerId, hashes: &[Hash32], now: Instant) -> FetchRequest {
        self.next_id += 1;
        let id = self.next_id;
        let mut items = Vec::with_capacity(hashes.len());
        let mut tracked = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            let Some(group) = self.groups.get_mut(hash) else { continue };
            let token = group.token.child_token();
            group.outstanding.insert(peer, id);
            group.tried.insert(peer);
            items.push((*hash, token.clone()));
            tracked.insert(*hash, token);
        }
        *self.per_peer.entry(peer).or_default() += items.len();
        self.requests.insert(
            id,
            Outstanding {
                peer,
                items: tracked,
                deadline: now + self.timeout,
            },
        );
        FetchRequest { id, peer, items }
    }

    /// A valid body arrived. Cancels the group and returns every peer that
    /// had been asked for it.
    pub fn complete(&mut self, hash: &Hash32) -> Option<Vec<PeerId>> {
        let group = self.groups.remove(hash)?;
        group.token.cancel();
        self.queue.remove(&(group.height, *hash));
        self.candidates.remove(hash);
        let mut asked: Vec<PeerId> = group.outstanding.keys().copied().collect();
        for (peer, id) in group.outstanding {
            self.release(id, peer, hash);
        }
        asked.sort();
        Some(asked)
    }

    /// `peer` delivered something unusable for `hash`. The body goes back
    /// in the queue if nobody else is working on it.
    pub fn fail(&mut self, hash: &Hash32, peer: &PeerId) {
        let Some(group) = self.groups.get_mut(hash) else { return };
        if let Some(id) = group.outstanding.remove(peer) {
            self.release(id, *peer, hash);
        }
        self.requeue_if_idle(hash);
    }

    /// Whether `peer` has an outstanding request for `hash`.
    pub fn is_outstanding(&self, hash: &Hash32, peer: &PeerId) -> bool {
        self.groups
            .get(hash)
            .is_some_and(|g| g.outstanding.contains_key(peer))
    }

    /// Time out overdue requests.
    pub fn expire(&mut self, now: Instant) -> Expired {
        let overdue: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut expired = Expired::default();
        let mut touched = Vec::new();
        for id in overdue {
            let Some(req) = self.requests.remove(&id) else { continue };
            if let Some(load) = self.per_peer.get_mut(&req.peer) {
                *load = load.saturating_sub(req.items.len());
            }
            for (hash, token) in req.items {
                token.cancel();
                if let Some(group) = self.groups.get_mut(&hash) {
                    group.outstanding.remove(&req.peer);
                }
                expired.timed_out.push((req.peer, hash));
                touched.push(hash);
            }
        }
        for hash in touched {
            if self.requeue_if_idle(&hash) {
                expired.abandoned.push(hash);
            }
        }
        if !expired.timed_out.is_empty() {
            debug!(
                timed_out = expired.timed_out.len(),
                abandoned = expired.abandoned.len(),
                "body fetch timeouts"
            );
        }
        expired
    }

    /// Forget a disconnected peer.
    pub fn peer_gone(&mut self, peer: &PeerId) {
        for c in self.candidates.values_mut() {
            c.remove(peer);
        }
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| r.peer == *peer)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(req) = self.requests.remove(&id) else { continue };
            for (hash, token) in req.items {
                token.cancel();
                if let Some(group) = self.groups.get_mut(&hash) {
                    group.outstanding.remove(peer);
                }
                self.requeue_if_idle(&hash);
            }
        }
        self.per_peer.remove(peer);
    }

    /// Drop bodies no longer wanted, e.g. after a reorg orphaned them.
    pub fn purge(&mut self, hashes: &HashSet<Hash32>) -> usize {
        let mut removed = 0;
        for hash in hashes {
            if self.complete(hash).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Put an idle body back in the queue. Returns `true` if it was
    /// abandoned instead.
    fn requeue_if_idle(&mut self, hash: &Hash32) -> bool {
        let Some(group) = self.groups.get(hash) else { return false };
        if !group.outstanding.is_empty() {
            return false;
        }
        if group.attempts >= self.max_attempts {
            self.complete(hash);
            return true;
        }
        // Allow a second pass over peers once every candidate was tried.
        let untried = self
            .candidates
            .get(hash)
            .is_some_and(|c| c.iter().any(|p| !group.tried.contains(p)));
        let height = group.height;
        if !untried {
            if let Some(g) = self.groups.get_mut(hash) {
                g.tried.clear();
            }
        }
        self.queue.insert((height, *hash));
        false
    }

    fn release(&mut self, id: u64, peer: PeerId, hash: &Hash32) {
        if let Some(req) = self.requests.get_mut(&id) {
            if req.items.remove(hash).is_some() {
                if let Some(load) = self.per_peer.get_mut(&peer) {
                    *load = load.saturating_sub(1);
                }
            }
            if req.items.is_empty() {
                self.requests.remove(&id);
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn tracked(&self) -> usize {
        self.groups.len()
    }

    pub fn in_flight(&self, peer: &PeerId) -> usize {
        self.per_peer.get(peer).copied().unwrap_or(0)
    }

    pub fn is_tracked(&self, hash: &Hash32) -> bool {
        self.groups.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn hash(n: u8) -> Hash32 {
        Hash32([n; 32])
    }

    fn by_id(p: &PeerId) -> f64 {
        p.0[0] as f64
    }

    #[test]
    fn hedges_to_best_announcers() {
        let now = Instant::now();
        let mut f = BodyFetcher::new(&SyncConfig::default());
        f.enqueue(hash(1), 1, (1..=5).map(peer));
        let reqs = f.schedule(now, &by_id, 64);
        let mut asked: Vec<PeerId> = reqs.iter().map(|r| r.peer).collect();
        asked.sort();
        assert_eq!(asked, vec![peer(3), peer(4), peer(5)]);
        assert_eq!(f.queued(), 0);

        // First arrival cancels the whole group.
        let settled = f.complete(&hash(1)).unwrap();
        assert_eq!(settled.len(), 3);
        assert!(reqs.iter().all(|r| r.to_message().is_none()));
        assert_eq!(f.in_flight(&peer(5)), 0);
    }

    #[test]
    fn lowest_height_first_and_batched() {
        let now = Instant::now();
        let cfg = SyncConfig {
            hedge_fanout: 1,
            max_blocks_per_request: 2,
            ..SyncConfig::default()
        };
        let mut f = BodyFetcher::new(&cfg);
        for h in [3u8, 1, 2] {
            f.enqueue(hash(h), h as u64, [peer(1)]);
        }
        let reqs = f.schedule(now, &by_id, 64);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].live_hashes(), vec![hash(1), hash(2)]);
        assert_eq!(reqs[1].live_hashes(), vec![hash(3)]);
    }

    #[test]
    fn timeout_retries_with_alternate_peer_then_abandons() {
        let now = Instant::now();
        let cfg = SyncConfig {
            hedge_fanout: 1,
            max_fetch_attempts: 2,
            ..SyncConfig::default()
        };
        let timeout = cfg.fetch_timeout();
        let mut f = BodyFetcher::new(&cfg);
        f.enqueue(hash(1), 1, [peer(1), peer(2)]);

        let first = f.schedule(now, &by_id, 64);
        assert_eq!(first[0].peer, peer(2));
        let later = now + timeout;
        let exp = f.expire(later);
        assert_eq!(exp.timed_out, vec![(peer(2), hash(1))]);
        assert!(exp.abandoned.is_empty());
        assert!(first[0].items[0].1.is_cancelled());

        let second = f.schedule(later, &by_id, 64);
        assert_eq!(second[0].peer, peer(1));
        let exp = f.expire(later + timeout);
        assert_eq!(exp.abandoned, vec![hash(1)]);
        assert!(!f.is_tracked(&hash(1)));
    }

    #[test]
    fn per_peer_limit_holds_back_work() {
        let now = Instant::now();
        let cfg = SyncConfig {
            hedge_fanout: 1,
            ..SyncConfig::default()
        };
        let mut f = BodyFetcher::new(&cfg);
        for h in 1..=4u8 {
            f.enqueue(hash(h), h as u64, [peer(1)]);
        }
        let reqs = f.schedule(now, &by_id, 2);
        assert_eq!(reqs.iter().map(|r| r.items.len()).sum::<usize>(), 2);
        assert_eq!(f.queued(), 2);
        assert_eq!(f.in_flight(&peer(1)), 2);
    }

    #[test]
    fn failed_delivery_requeues() {
        let now = Instant::now();
        let cfg = SyncConfig {
            hedge_fanout: 1,
            ..SyncConfig::default()
        };
        let mut f = BodyFetcher::new(&cfg);
        f.enqueue(hash(1), 1, [peer(1), peer(2)]);
        let reqs = f.schedule(now, &by_id, 8);
        assert!(f.is_outstanding(&hash(1), &reqs[0].peer));
        f.fail(&hash(1), &reqs[0].peer);
        assert_eq!(f.queued(), 1);
        let again = f.schedule(now, &by_id, 8);
        assert_ne!(again[0].peer, reqs[0].peer);
    }

    #[tokio::test]
    async fn settled_resolves_on_completion() {
        let now = Instant::now();
        let mut f = BodyFetcher::new(&SyncConfig::default());
        f.enqueue(hash(1), 1, [peer(1)]);
        let req = f.schedule(now, &by_id, 8).remove(0);
        f.complete(&hash(1));
        tokio::time::timeout(Duration::from_secs(1), req.settled())
            .await
            .unwrap();
    }
}
