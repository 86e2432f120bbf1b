//! # Transaction and Share Relay
//!
//! Inventory-driven relay: a peer announces ids, we request the ones we have
//! neither seen nor asked for, the bodies come back as `data`, pass cheap
//! checks, and are admitted. Admitted ids go into a rolling dedup window so
//! they are never requested again while the window holds them.
//!
//! Each peer also has a short-lived "already knows" set: ids it announced
//! or delivered to us, and ids we announced to it. We never announce an id
//! to a peer that is in that set.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::config::{MAX_INV_ITEMS, MAX_TX_BYTES};
use crate::error::Severity;
use crate::gossip::validate::{check_share, check_tx, CheckContext};
use crate::gossip::{DedupWindow, GossipConfig, GossipReject};
use crate::types::{Hash32, PeerId};
use crate::wire::from_canonical_cbor;
use crate::wire::messages::ids;
use crate::wire::objects::{tx_id, ShareEnvelope, TxEnvelope};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub max_tx_bytes: usize,
    pub min_gas_limit: u64,
    pub max_gas_limit: u64,
    pub min_gas_price: u64,
    /// Nonces above this are treated as garbage.
    pub max_nonce: u64,
    /// How long an id stays in a peer's "already knows" set.
    pub recent_ttl_ms: u64,
    pub recent_cap_per_peer: usize,
    pub max_inv_items: usize,
    /// How long a `getdata` may stay unanswered before the id can be asked
    /// of someone else.
    pub request_ttl_ms: u64,
    /// Outstanding `getdata` ids across all peers.
    pub max_pending: usize,
    pub max_pending_per_peer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_tx_bytes: MAX_TX_BYTES,
            min_gas_limit: 21_000,
            max_gas_limit: 30_000_000,
            min_gas_price: 1,
            max_nonce: u64::MAX / 2,
            recent_ttl_ms: 20_000,
            recent_cap_per_peer: 4096,
            max_inv_items: MAX_INV_ITEMS,
            request_ttl_ms: 10_000,
            max_pending: 8 * MAX_INV_ITEMS,
            max_pending_per_peer: MAX_INV_ITEMS,
        }
    }
}

impl RelayConfig {
    pub fn recent_ttl(&self) -> Duration {
        Duration::from_millis(self.recent_ttl_ms)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayReject {
    #[error("{count} inventory items, limit {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("{len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },

    #[error("malformed body: {0}")]
    Malformed(String),

    #[error("item id {claimed} does not match content {actual}")]
    IdMismatch { claimed: Hash32, actual: Hash32 },

    #[error("{0} was not requested")]
    Unsolicited(Hash32),

    #[error("gas limit {0} out of bounds")]
    GasLimit(u64),

    #[error("gas price {0} below minimum")]
    GasPrice(u64),

    #[error("nonce {0} out of bounds")]
    Nonce(u64),

    #[error(transparent)]
    Check(#[from] GossipReject),
}

impl RelayReject {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Check(e) => e.severity(),
            Self::IdMismatch { .. } | Self::TooManyItems { .. } => Severity::Structural,
            _ => Severity::Soft,
        }
    }

    /// Whether the sender deserves a penalty.
    pub fn is_penalized(&self) -> bool {
        !matches!(self, Self::Unsolicited(_))
    }
}

// ---------------------------------------------------------------------------
// Per-peer suppression
// ---------------------------------------------------------------------------

/// Ids a peer is known to have, stamped with when we learned it.
struct Known {
    ids: LruCache<Hash32, Instant>,
}

impl Known {
    fn new(cap: NonZeroUsize) -> Self {
        Self {
            ids: LruCache::new(cap),
        }
    }

    fn insert(&mut self, id: Hash32, now: Instant) {
        self.ids.put(id, now);
    }

    fn knows(&self, id: &Hash32, now: Instant, ttl: Duration) -> bool {
        self.ids
            .peek(id)
            .is_some_and(|at| now.saturating_duration_since(*at) < ttl)
    }

    fn expire(&mut self, now: Instant, ttl: Duration) {
        let stale: Vec<Hash32> = self
            .ids
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.ids.pop(&id);
        }
    }
}

/// Shared bookkeeping of both relays.
struct RelayState {
    seen: DedupWindow,
    /// Requested ids: who we asked and when.
    pending: HashMap<Hash32, (PeerId, Instant)>,
    /// Outstanding requests per asked peer.
    asked: HashMap<PeerId, usize>,
    known: HashMap<PeerId, Known>,
    recent_ttl: Duration,
    request_ttl: Duration,
    recent_cap: NonZeroUsize,
    max_items: usize,
    max_pending: usize,
    max_pending_per_peer: usize,
}

impl RelayState {
    fn new(relay: &RelayConfig, gossip: &GossipConfig, now: Instant) -> Self {
        Self {
            seen: DedupWindow::from_config(gossip, now),
            pending: HashMap::new(),
            asked: HashMap::new(),
            known: HashMap::new(),
            recent_ttl: relay.recent_ttl(),
            request_ttl: relay.request_ttl(),
            recent_cap: NonZeroUsize::new(relay.recent_cap_per_peer).unwrap_or(NonZeroUsize::MIN),
            max_items: relay.max_inv_items,
            max_pending: relay.max_pending,
            max_pending_per_peer: relay.max_pending_per_peer,
        }
    }

    fn mark_known(&mut self, peer: PeerId, id: Hash32, now: Instant) {
        let cap = self.recent_cap;
        self.known
            .entry(peer)
            .or_insert_with(|| Known::new(cap))
            .insert(id, now);
    }

    fn release(&mut self, peer: &PeerId) {
        if let Some(n) = self.asked.get_mut(peer) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.asked.remove(peer);
            }
        }
    }

    fn on_announce(
        &mut self,
        peer: PeerId,
        ids: &[Hash32],
        now: Instant,
    ) -> Result<Vec<Hash32>, RelayReject> {
        if ids.len() > self.max_items {
            return Err(RelayReject::TooManyItems {
                count: ids.len(),
                max: self.max_items,
            });
        }
        let mut wanted = Vec::new();
        for id in ids {
            self.mark_known(peer, *id, now);
            if self.seen.contains(id) || self.pending.contains_key(id) {
                continue;
            }
            let outstanding = self.asked.get(&peer).copied().unwrap_or(0);
            if outstanding >= self.max_pending_per_peer || self.pending.len() >= self.max_pending {
                continue;
            }
            self.pending.insert(*id, (peer, now));
            *self.asked.entry(peer).or_default() += 1;
            wanted.push(*id);
        }
        if wanted.len() < ids.len() {
            trace!(
                peer = %peer.short(),
                announced = ids.len(),
                wanted = wanted.len(),
                pending = self.pending.len(),
                "inventory partly skipped"
            );
        }
        Ok(wanted)
    }

    fn take_pending(&mut self, peer: &PeerId, id: &Hash32) -> Result<(), RelayReject> {
        match self.pending.get(id) {
            Some((asked, _)) if asked == peer => {
                self.pending.remove(id);
                self.release(peer);
                Ok(())
            }
            _ => Err(RelayReject::Unsolicited(*id)),
        }
    }

    fn admit(&mut self, peer: PeerId, id: Hash32, now: Instant) -> bool {
        self.mark_known(peer, id, now);
        self.seen.check_and_insert(id, now)
    }

    fn targets(&mut self, id: Hash32, peers: &[PeerId], now: Instant) -> Vec<PeerId> {
        let mut out = Vec::new();
        for peer in peers {
            if self
                .known
                .get(peer)
                .is_some_and(|k| k.knows(&id, now, self.recent_ttl))
            {
                continue;
            }
            self.mark_known(*peer, id, now);
            out.push(*peer);
        }
        out
    }

    fn expire(&mut self, now: Instant) {
        let ttl = self.request_ttl;
        let asked = &mut self.asked;
        self.pending.retain(|_, (peer, at)| {
            let live = now.saturating_duration_since(*at) < ttl;
            if !live {
                if let Some(n) = asked.get_mut(peer) {
                    *n = n.saturating_sub(1);
                }
            }
            live
        });
        self.asked.retain(|_, n| *n > 0);
        let recent = self.recent_ttl;
        self.known.retain(|_, k| {
            k.expire(now, recent);
            !k.ids.is_empty()
        });
        self.seen.maybe_rotate(now);
    }

    fn peer_gone(&mut self, peer: &PeerId) {
        self.known.remove(peer);
        self.asked.remove(peer);
        self.pending.retain(|_, (asked, _)| asked != peer);
    }
}

// ---------------------------------------------------------------------------
// TxRelay
// ---------------------------------------------------------------------------

pub struct TxRelay {
    cfg: RelayConfig,
    gossip: GossipConfig,
    chain_id: u64,
    state: RelayState,
}

impl TxRelay {
    pub fn new(cfg: &RelayConfig, gossip: &GossipConfig, chain_id: u64, now: Instant) -> Self {
        Self {
            cfg: cfg.clone(),
            gossip: gossip.clone(),
            chain_id,
            state: RelayState::new(cfg, gossip, now),
        }
    }

    /// Ids from an `inv` worth a `getdata`.
    pub fn on_announce(
        &mut self,
        peer: PeerId,
        ids: &[Hash32],
        now: Instant,
    ) -> Result<Vec<Hash32>, RelayReject> {
        self.state.on_announce(peer, ids, now)
    }

    /// A requested tx body. `Ok(None)` means it was already admitted.
    pub fn on_data(
        &mut self,
        peer: PeerId,
        claimed: Hash32,
        raw: &[u8],
        now: Instant,
    ) -> Result<Option<TxEnvelope>, RelayReject> {
        self.state.take_pending(&peer, &claimed)?;
        let id = tx_id(raw);
        if id != claimed {
            return Err(RelayReject::IdMismatch { claimed, actual: id });
        }
        let tx = self.check(raw)?;
        if !self.state.admit(peer, id, now) {
            return Ok(None);
        }
        trace!(peer = %peer.short(), tx = %id.short(), "tx admitted");
        Ok(Some(tx))
    }

    /// Size, encoding, chain, signature shape, nonce and gas bounds.
    pub fn check(&self, raw: &[u8]) -> Result<TxEnvelope, RelayReject> {
        if raw.len() > self.cfg.max_tx_bytes {
            return Err(RelayReject::TooLarge {
                len: raw.len(),
                max: self.cfg.max_tx_bytes,
            });
        }
        let tx: TxEnvelope =
            from_canonical_cbor(ids::DATA, raw).map_err(|e| RelayReject::Malformed(e.to_string()))?;
        let ctx = CheckContext {
            cfg: &self.gossip,
            chain_id: self.chain_id,
            threshold: 0,
            policy_root: None,
            now_unix: 0,
        };
        check_tx(&tx, &ctx)?;
        if !(self.cfg.min_gas_limit..=self.cfg.max_gas_limit).contains(&tx.gas_limit) {
            return Err(RelayReject::GasLimit(tx.gas_limit));
        }
        if tx.gas_price < self.cfg.min_gas_price {
            return Err(RelayReject::GasPrice(tx.gas_price));
        }
        if tx.nonce > self.cfg.max_nonce {
            return Err(RelayReject::Nonce(tx.nonce));
        }
        Ok(tx)
    }

    /// Mark a locally originated or gossiped tx as seen.
    pub fn note_seen(&mut self, id: Hash32, from: Option<PeerId>, now: Instant) -> bool {
        if let Some(peer) = from {
            self.state.mark_known(peer, id, now);
        }
        self.state.seen.check_and_insert(id, now)
    }

    /// Peers among `peers` that should hear about `id`.
    pub fn announce_targets(&mut self, id: Hash32, peers: &[PeerId], now: Instant) -> Vec<PeerId> {
        self.state.targets(id, peers, now)
    }

    /// Txs of orphaned blocks become fresh again; those of adopted blocks
    /// are spent and must not be re-relayed.
    pub fn on_reorg(&mut self, orphaned: &[Hash32], adopted: &[Hash32], now: Instant) -> usize {
        let n = self.state.seen.invalidate(orphaned);
        for id in adopted {
            self.state.seen.check_and_insert(*id, now);
        }
        n
    }

    pub fn has_seen(&self, id: &Hash32) -> bool {
        self.state.seen.contains(id)
    }

    pub fn pending(&self) -> usize {
        self.state.pending.len()
    }

    pub fn expire(&mut self, now: Instant) {
        self.state.expire(now);
    }

    pub fn peer_gone(&mut self, peer: &PeerId) {
        self.state.peer_gone(peer);
    }
}

// ---------------------------------------------------------------------------
// ShareRelay
// ---------------------------------------------------------------------------

pub struct ShareRelay {
    gossip: GossipConfig,
    state: RelayState,
}

impl ShareRelay {
    pub fn new(cfg: &RelayConfig, gossip: &GossipConfig, now: Instant) -> Self {
        Self {
            gossip: gossip.clone(),
            state: RelayState::new(cfg, gossip, now),
        }
    }

    pub fn on_announce(
        &mut self,
        peer: PeerId,
        ids: &[Hash32],
        now: Instant,
    ) -> Result<Vec<Hash32>, RelayReject> {
        self.state.on_announce(peer, ids, now)
    }

    /// A requested share. `threshold` is the consensus threshold in force.
    pub fn on_data(
        &mut self,
        peer: PeerId,
        claimed: Hash32,
        raw: &[u8],
        threshold: u64,
        now_unix: u64,
        now: Instant,
    ) -> Result<Option<ShareEnvelope>, RelayReject> {
        self.state.take_pending(&peer, &claimed)?;
        let share: ShareEnvelope =
            from_canonical_cbor(ids::DATA, raw).map_err(|e| RelayReject::Malformed(e.to_string()))?;
        let id = share.share_id();
        if id != claimed {
            return Err(RelayReject::IdMismatch { claimed, actual: id });
        }
        let ctx = CheckContext {
            cfg: &self.gossip,
            chain_id: 0,
            threshold,
            policy_root: None,
            now_unix,
        };
        check_share(&share, &ctx)?;
        if !self.state.admit(peer, id, now) {
            return Ok(None);
        }
        trace!(peer = %peer.short(), share = %id.short(), "share admitted");
        Ok(Some(share))
    }

    pub fn note_seen(&mut self, id: Hash32, from: Option<PeerId>, now: Instant) -> bool {
        if let Some(peer) = from {
            self.state.mark_known(peer, id, now);
        }
        self.state.seen.check_and_insert(id, now)
    }

    pub fn announce_targets(&mut self, id: Hash32, peers: &[PeerId], now: Instant) -> Vec<PeerId> {
        self.state.targets(id, peers, now)
    }

    pub fn invalidate(&mut self, ids: &[Hash32]) -> usize {
        self.state.seen.invalidate(ids)
    }

    pub fn has_seen(&self, id: &Hash32) -> bool {
        self.state.seen.contains(id)
    }

    pub fn expire(&mut self, now: Instant) {
        self.state.expire(now);
    }

    pub fn peer_gone(&mut self, peer: &PeerId) {
        self.state.peer_gone(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignatureAlg;
    use crate::wire::to_cbor;

    const CHAIN: u64 = 9;
    const NOW: u64 = 1_700_000_000;

    fn tx(nonce: u64) -> TxEnvelope {
        TxEnvelope {
            chain_id: CHAIN,
            nonce,
            gas_limit: 50_000,
            gas_price: 3,
            sender: Hash32([5; 32]),
            sig_alg: SignatureAlg::Ed25519 as u8,
            payload: vec![1, 2, 3],
            signature: vec![0xAA; SignatureAlg::Ed25519.signature_len()],
        }
    }

    fn share() -> ShareEnvelope {
        ShareEnvelope {
            type_id: 1,
            nullifier: Hash32([3; 32]),
            difficulty: 50_000,
            target_ratio: 50_000,
            metrics_timestamp: NOW - 5,
            body: vec![7; 16],
        }
    }

    fn relay(now: Instant) -> TxRelay {
        TxRelay::new(&RelayConfig::default(), &GossipConfig::default(), CHAIN, now)
    }

    #[test]
    fn announce_request_admit() {
        let now = Instant::now();
        let mut r = relay(now);
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let raw = to_cbor(&tx(1)).unwrap();
        let id = tx_id(&raw);

        assert_eq!(r.on_announce(a, &[id], now).unwrap(), vec![id]);
        // Asked of `a` already; `b` announcing it changes nothing.
        assert!(r.on_announce(b, &[id], now).unwrap().is_empty());
        assert!(matches!(
            r.on_data(b, id, &raw, now),
            Err(RelayReject::Unsolicited(_))
        ));

        assert_eq!(r.on_data(a, id, &raw, now).unwrap(), Some(tx(1)));
        assert!(r.has_seen(&id));
        assert!(r.on_announce(b, &[id], now).unwrap().is_empty());
        // Both peers already know it.
        assert!(r.announce_targets(id, &[a, b], now).is_empty());
        let c = PeerId([3; 32]);
        assert_eq!(r.announce_targets(id, &[a, b, c], now), vec![c]);
        assert!(r.announce_targets(id, &[c], now).is_empty());
    }

    #[test]
    fn gas_and_size_bounds() {
        let now = Instant::now();
        let r = relay(now);
        let mut t = tx(1);
        t.gas_limit = 10;
        assert_eq!(r.check(&to_cbor(&t).unwrap()), Err(RelayReject::GasLimit(10)));
        let mut t = tx(1);
        t.gas_price = 0;
        assert_eq!(r.check(&to_cbor(&t).unwrap()), Err(RelayReject::GasPrice(0)));
        let mut t = tx(1);
        t.signature.pop();
        assert!(matches!(
            r.check(&to_cbor(&t).unwrap()),
            Err(RelayReject::Check(GossipReject::SignatureShape))
        ));
        let big = vec![0u8; MAX_TX_BYTES + 1];
        assert!(matches!(r.check(&big), Err(RelayReject::TooLarge { .. })));
    }

    #[test]
    fn id_mismatch_is_structural() {
        let now = Instant::now();
        let mut r = relay(now);
        let peer = PeerId([1; 32]);
        let bogus = Hash32([9; 32]);
        r.on_announce(peer, &[bogus], now).unwrap();
        let err = r.on_data(peer, bogus, &to_cbor(&tx(1)).unwrap(), now).unwrap_err();
        assert_eq!(err.severity(), Severity::Structural);
    }

    #[test]
    fn reorg_frees_orphaned_txs() {
        let now = Instant::now();
        let mut r = relay(now);
        let orphaned = Hash32([1; 32]);
        let adopted = Hash32([2; 32]);
        r.note_seen(orphaned, None, now);
        r.on_reorg(&[orphaned], &[adopted], now);
        assert!(!r.has_seen(&orphaned));
        assert!(r.has_seen(&adopted));
    }

    #[test]
    fn unanswered_requests_expire() {
        let now = Instant::now();
        let mut r = relay(now);
        let id = Hash32([4; 32]);
        r.on_announce(PeerId([1; 32]), &[id], now).unwrap();
        assert_eq!(r.pending(), 1);
        r.expire(now + RelayConfig::default().request_ttl());
        assert_eq!(r.pending(), 0);
        assert_eq!(r.on_announce(PeerId([2; 32]), &[id], now).unwrap(), vec![id]);
    }

    #[test]
    fn outstanding_requests_are_capped() {
        let now = Instant::now();
        let cfg = RelayConfig {
            max_pending: 3,
            max_pending_per_peer: 2,
            ..RelayConfig::default()
        };
        let mut r = TxRelay::new(&cfg, &GossipConfig::default(), CHAIN, now);
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let ids: Vec<Hash32> = (1..=4u8).map(|i| Hash32([i; 32])).collect();

        assert_eq!(r.on_announce(a, &ids, now).unwrap(), ids[..2].to_vec());
        // Global cap leaves room for one more, from anyone.
        assert_eq!(r.on_announce(b, &ids, now).unwrap(), vec![ids[2]]);
        assert_eq!(r.pending(), 3);
        assert!(r.on_announce(b, &ids, now).unwrap().is_empty());

        // An expired request frees both budgets.
        r.expire(now + cfg.request_ttl());
        assert_eq!(r.pending(), 0);
        let later = now + cfg.request_ttl();
        assert_eq!(r.on_announce(a, &ids[3..], later).unwrap(), vec![ids[3]]);
    }

    #[test]
    fn known_ids_fade_after_recent_ttl() {
        let now = Instant::now();
        let cfg = RelayConfig {
            recent_cap_per_peer: 2,
            ..RelayConfig::default()
        };
        let mut r = TxRelay::new(&cfg, &GossipConfig::default(), CHAIN, now);
        let peer = PeerId([1; 32]);
        let (x, y, z) = (Hash32([1; 32]), Hash32([2; 32]), Hash32([3; 32]));
        assert_eq!(r.announce_targets(x, &[peer], now), vec![peer]);
        assert!(r.announce_targets(x, &[peer], now).is_empty());

        // Capacity two: y and z push x out.
        r.announce_targets(y, &[peer], now);
        r.announce_targets(z, &[peer], now);
        assert_eq!(r.announce_targets(x, &[peer], now), vec![peer]);

        let later = now + cfg.recent_ttl();
        assert_eq!(r.announce_targets(z, &[peer], later), vec![peer]);
        r.expire(later);
        assert_eq!(r.announce_targets(x, &[peer], later), vec![peer]);
        assert!(r.announce_targets(z, &[peer], later).is_empty());
    }

    #[test]
    fn share_checks_against_threshold() {
        let now = Instant::now();
        let mut r = ShareRelay::new(&RelayConfig::default(), &GossipConfig::default(), now);
        let peer = PeerId([1; 32]);
        let s = share();
        let id = s.share_id();
        r.on_announce(peer, &[id], now).unwrap();
        let got = r
            .on_data(peer, id, &to_cbor(&s).unwrap(), 1_000_000, NOW, now)
            .unwrap();
        assert_eq!(got, Some(s));

        let mut bad = share();
        bad.nullifier = Hash32([4; 32]);
        bad.target_ratio = 900_000;
        let bad_id = bad.share_id();
        r.on_announce(peer, &[bad_id], now).unwrap();
        let err = r
            .on_data(peer, bad_id, &to_cbor(&bad).unwrap(), 1_000_000, NOW, now)
            .unwrap_err();
        assert!(matches!(err, RelayReject::Check(GossipReject::ShareRatio { .. })));
        assert!(!r.has_seen(&bad_id));
    }
}
