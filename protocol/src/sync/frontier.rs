//! # Header Frontier
//!
//! Every header we have attached, as a tree rooted at genesis, plus the
//! canonical chain picked by fork choice:
//!
//! - highest cumulative weight wins;
//! - equal weight goes to the lowest hash;
//! - the rule is re-run on every attached header.
//!
//! Switching branches is a reorg, and its depth is the number of canonical
//! headers it would orphan. Depth beyond `soft_reorg_depth` needs at least
//! `min_corroborating_peers` distinct peers to have served the competing
//! branch, otherwise the branch is held. Depth beyond `hard_reorg_depth`
//! puts the frontier in safe mode instead of switching. With late
//! finalization on, such a branch is only held until corroborated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::Severity;
use crate::sync::chain_view::{ChainView, HeadInfo};
use crate::sync::header::locator_heights;
use crate::sync::SyncConfig;
use crate::types::{Hash32, PeerId};
use crate::wire::objects::BlockHeader;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrontierError {
    #[error("parent {0} is not attached")]
    UnknownParent(Hash32),

    #[error("height {got} does not follow parent (expected {expected})")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("header {0} is not attached")]
    UnknownHeader(Hash32),

    #[error("not in safe mode")]
    NotInSafeMode,
}

impl FrontierError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::UnknownParent(_) | Self::HeightMismatch { .. } => Severity::Structural,
            Self::UnknownHeader(_) | Self::NotInSafeMode => Severity::Soft,
        }
    }
}

/// A switch of the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorg {
    pub old_tip: Hash32,
    pub new_tip: Hash32,
    pub fork_point: Hash32,
    pub depth: u64,
    /// Formerly canonical headers above the fork point, ascending.
    pub orphaned: Vec<Hash32>,
    /// Newly canonical headers above the fork point, ascending.
    pub adopted: Vec<Hash32>,
}

/// Safe-mode details: the branch that would have won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeMode {
    pub candidate: Hash32,
    pub depth: u64,
}

/// What attaching a header did to the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attach {
    /// Already attached; only the announcer set changed.
    Known,
    /// Attached off the canonical chain, which is unchanged.
    SideBranch,
    /// Appended to the canonical tip.
    Extended,
    Reorg(Reorg),
    /// Heavier, but too deep to adopt on the word of too few peers.
    Held {
        candidate: Hash32,
        depth: u64,
        corroborating: usize,
    },
    /// Heavier and beyond the hard depth. Body import stops.
    SafeMode(SafeMode),
}

#[derive(Debug)]
struct Entry {
    header: BlockHeader,
    total_weight: u128,
    has_body: bool,
    announcers: HashSet<PeerId>,
}

pub struct Frontier {
    entries: HashMap<Hash32, Entry>,
    /// Canonical hash at each height.
    canonical: Vec<Hash32>,
    held: Option<Hash32>,
    safe_mode: Option<SafeMode>,
    /// Lowest canonical height that may still lack a body.
    body_floor: u64,
    soft_depth: u64,
    hard_depth: u64,
    min_corroborating: usize,
    late_finalization: bool,
}

impl Frontier {
    pub fn new(genesis: BlockHeader, cfg: &SyncConfig) -> Self {
        let hash = genesis.hash();
        let mut entries = HashMap::new();
        entries.insert(
            hash,
            Entry {
                total_weight: genesis.weight as u128,
                header: genesis,
                has_body: true,
                announcers: HashSet::new(),
            },
        );
        Self {
            entries,
            canonical: vec![hash],
            held: None,
            safe_mode: None,
            body_floor: 1,
            soft_depth: cfg.soft_reorg_depth,
            hard_depth: cfg.hard_reorg_depth,
            min_corroborating: cfg.min_corroborating_peers,
            late_finalization: cfg.late_finalization,
        }
    }

    // -----------------------------------------------------------------------
    // Attaching
    // -----------------------------------------------------------------------

    /// Attach `header`, served by `from`, and re-run fork choice.
    pub fn insert(
        &mut self,
        header: BlockHeader,
        from: Option<PeerId>,
    ) -> Result<Attach, FrontierError> {
        let hash = header.hash();
        if let Some(entry) = self.entries.get_mut(&hash) {
            let fresh = from.is_some_and(|p| entry.announcers.insert(p));
            // A new voice for a held branch may be what tips it over.
            if fresh {
                if let Some(held) = self.held {
                    let outcome = self.evaluate(held);
                    if !matches!(outcome, Attach::Held { .. } | Attach::SideBranch | Attach::Known) {
                        return Ok(outcome);
                    }
                }
            }
            return Ok(Attach::Known);
        }

        let parent = self
            .entries
            .get(&header.parent)
            .ok_or(FrontierError::UnknownParent(header.parent))?;
        if header.height != parent.header.height + 1 {
            return Err(FrontierError::HeightMismatch {
                expected: parent.header.height + 1,
                got: header.height,
            });
        }
        let total_weight = parent.total_weight + header.weight as u128;
        self.entries.insert(
            hash,
            Entry {
                header,
                total_weight,
                has_body: false,
                announcers: from.into_iter().collect(),
            },
        );
        Ok(self.evaluate(hash))
    }

    fn evaluate(&mut self, candidate: Hash32) -> Attach {
        let best = self.best();
        if candidate == best || !self.outweighs(&candidate, &best) {
            return Attach::SideBranch;
        }
        let Some(entry) = self.entries.get(&candidate) else {
            return Attach::SideBranch;
        };
        if entry.header.parent == best {
            self.canonical.push(candidate);
            if self.held.is_some_and(|h| !self.outweighs(&h, &candidate)) {
                self.held = None;
            }
            return Attach::Extended;
        }

        let fork = self.fork_point(candidate);
        let best_height = self.canonical.len() as u64 - 1;
        let fork_height = self.height_of(&fork).unwrap_or(0);
        let depth = best_height - fork_height;
        let corroborating = self.branch_announcers(candidate, fork).len();
        let corroborated = corroborating >= self.min_corroborating;

        if depth > self.hard_depth && !self.late_finalization {
            let mode = SafeMode { candidate, depth };
            if self.safe_mode.is_none() {
                warn!(
                    depth,
                    candidate = %candidate.short(),
                    corroborating,
                    "deep reorg, entering safe mode"
                );
            }
            self.safe_mode = Some(mode);
            self.held = None;
            return Attach::SafeMode(mode);
        }
        if depth > self.soft_depth && !corroborated {
            debug!(
                depth,
                candidate = %candidate.short(),
                corroborating,
                "reorg held for corroboration"
            );
            self.held = Some(candidate);
            return Attach::Held {
                candidate,
                depth,
                corroborating,
            };
        }
        Attach::Reorg(self.adopt(candidate, fork, depth))
    }

    fn adopt(&mut self, candidate: Hash32, fork: Hash32, depth: u64) -> Reorg {
        let old_tip = self.best();
        let fork_height = self.height_of(&fork).unwrap_or(0);

        let mut adopted = Vec::new();
        let mut cursor = candidate;
        while cursor != fork {
            adopted.push(cursor);
            match self.entries.get(&cursor) {
                Some(e) => cursor = e.header.parent,
                None => break,
            }
        }
        adopted.reverse();

        let orphaned = self.canonical.split_off(fork_height as usize + 1);
        self.canonical.extend_from_slice(&adopted);
        self.body_floor = self.body_floor.min(fork_height + 1);
        self.held = None;
        info!(
            depth,
            old_tip = %old_tip.short(),
            new_tip = %candidate.short(),
            "canonical chain reorganised"
        );
        Reorg {
            old_tip,
            new_tip: candidate,
            fork_point: fork,
            depth,
            orphaned,
            adopted,
        }
    }

    /// Lift safe mode. The held branch is adopted if it still outweighs the
    /// canonical tip; the operator's call replaces corroboration.
    pub fn exit_safe_mode(&mut self) -> Result<Option<Reorg>, FrontierError> {
        let mode = self.safe_mode.take().ok_or(FrontierError::NotInSafeMode)?;
        let best = self.best();
        if !self.entries.contains_key(&mode.candidate) || !self.outweighs(&mode.candidate, &best) {
            info!("safe mode lifted, canonical chain kept");
            return Ok(None);
        }
        let fork = self.fork_point(mode.candidate);
        let depth = self.canonical.len() as u64 - 1 - self.height_of(&fork).unwrap_or(0);
        info!(depth, "safe mode lifted, adopting held branch");
        Ok(Some(self.adopt(mode.candidate, fork, depth)))
    }

    fn outweighs(&self, a: &Hash32, b: &Hash32) -> bool {
        match (self.entries.get(a), self.entries.get(b)) {
            (Some(x), Some(y)) => {
                x.total_weight > y.total_weight || (x.total_weight == y.total_weight && a < b)
            }
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Nearest canonical ancestor of `hash`.
    fn fork_point(&self, hash: Hash32) -> Hash32 {
        let mut cursor = hash;
        while !self.is_canonical(&cursor) {
            match self.entries.get(&cursor) {
                Some(e) => cursor = e.header.parent,
                None => return self.canonical[0],
            }
        }
        cursor
    }

    fn branch_announcers(&self, tip: Hash32, fork: Hash32) -> HashSet<PeerId> {
        let mut peers = HashSet::new();
        let mut cursor = tip;
        while cursor != fork {
            let Some(e) = self.entries.get(&cursor) else { break };
            peers.extend(e.announcers.iter().copied());
            cursor = e.header.parent;
        }
        peers
    }

    /// Drop side branches that leave the canonical chain below `floor`.
    /// Canonical headers and the branches of a held or safe-mode candidate
    /// stay. Returns how many headers were dropped.
    pub fn prune_side_branches(&mut self, floor: u64) -> usize {
        let mut keep = HashSet::new();
        let candidates = self.held.into_iter().chain(self.safe_mode.map(|m| m.candidate));
        for tip in candidates {
            let fork = self.fork_point(tip);
            let mut cursor = tip;
            while cursor != fork {
                let Some(e) = self.entries.get(&cursor) else { break };
                keep.insert(cursor);
                cursor = e.header.parent;
            }
        }

        let doomed: Vec<Hash32> = self
            .entries
            .keys()
            .filter(|h| !keep.contains(*h) && !self.is_canonical(h))
            .filter(|h| {
                let fork = self.fork_point(**h);
                self.height_of(&fork).unwrap_or(0) < floor
            })
            .copied()
            .collect();
        for hash in &doomed {
            self.entries.remove(hash);
        }
        if !doomed.is_empty() {
            debug!(floor, dropped = doomed.len(), "side branches pruned");
        }
        doomed.len()
    }

    // -----------------------------------------------------------------------
    // Bodies
    // -----------------------------------------------------------------------

    /// Record that a body for `hash` has been imported.
    pub fn mark_body(&mut self, hash: &Hash32) -> Result<(), FrontierError> {
        let entry = self
            .entries
            .get_mut(hash)
            .ok_or(FrontierError::UnknownHeader(*hash))?;
        entry.has_body = true;
        Ok(())
    }

    /// Canonical headers still lacking a body, lowest first.
    pub fn missing_bodies(&mut self, limit: usize) -> Vec<(u64, Hash32)> {
        while let Some(hash) = self.canonical.get(self.body_floor as usize) {
            if self.entries.get(hash).is_some_and(|e| e.has_body) {
                self.body_floor += 1;
            } else {
                break;
            }
        }
        self.canonical
            .iter()
            .enumerate()
            .skip(self.body_floor as usize)
            .filter(|(_, h)| self.entries.get(*h).is_some_and(|e| !e.has_body))
            .take(limit)
            .map(|(height, h)| (height as u64, *h))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn best(&self) -> Hash32 {
        *self.canonical.last().unwrap_or(&Hash32::ZERO)
    }

    pub fn genesis(&self) -> Hash32 {
        self.canonical[0]
    }

    pub fn head(&self) -> HeadInfo {
        let hash = self.best();
        let total_weight = self.entries.get(&hash).map(|e| e.total_weight).unwrap_or(0);
        HeadInfo {
            hash,
            height: self.canonical.len() as u64 - 1,
            total_weight,
        }
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn header(&self, hash: &Hash32) -> Option<&BlockHeader> {
        self.entries.get(hash).map(|e| &e.header)
    }

    pub fn height_of(&self, hash: &Hash32) -> Option<u64> {
        self.entries.get(hash).map(|e| e.header.height)
    }

    pub fn has_body(&self, hash: &Hash32) -> bool {
        self.entries.get(hash).is_some_and(|e| e.has_body)
    }

    pub fn is_canonical(&self, hash: &Hash32) -> bool {
        self.entries
            .get(hash)
            .and_then(|e| self.canonical.get(e.header.height as usize))
            .is_some_and(|h| h == hash)
    }

    pub fn canonical_at(&self, height: u64) -> Option<Hash32> {
        self.canonical.get(height as usize).copied()
    }

    pub fn announcers(&self, hash: &Hash32) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .get(hash)
            .map(|e| e.announcers.iter().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    pub fn add_announcer(&mut self, hash: &Hash32, peer: PeerId) {
        if let Some(e) = self.entries.get_mut(hash) {
            e.announcers.insert(peer);
        }
    }

    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode.is_some()
    }

    pub fn safe_mode(&self) -> Option<SafeMode> {
        self.safe_mode
    }

    pub fn held(&self) -> Option<Hash32> {
        self.held
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block locator for the canonical tip.
    pub fn locator(&self) -> Vec<Hash32> {
        locator_heights(self.head().height)
            .into_iter()
            .filter_map(|h| self.canonical_at(h))
            .collect()
    }

    /// Answer a `getheaders`: canonical headers after the first locator hash
    /// we recognise, up to `max`, ending at `stop` if it is non-zero.
    pub fn headers_after(&self, locator: &[Hash32], stop: &Hash32, max: usize) -> Vec<BlockHeader> {
        let start = locator
            .iter()
            .find(|h| self.is_canonical(h))
            .and_then(|h| self.height_of(h))
            .unwrap_or(0)
            + 1;
        let mut out = Vec::new();
        for hash in self.canonical.iter().skip(start as usize).take(max) {
            let Some(e) = self.entries.get(hash) else { break };
            out.push(e.header.clone());
            if !stop.is_zero() && hash == stop {
                break;
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Shared read-only view
// ---------------------------------------------------------------------------

/// Read handle on a frontier owned by the coordinator.
#[derive(Clone)]
pub struct FrontierView {
    inner: Arc<RwLock<Frontier>>,
}

impl FrontierView {
    pub fn new(inner: Arc<RwLock<Frontier>>) -> Self {
        Self { inner }
    }
}

impl ChainView for FrontierView {
    fn head(&self) -> HeadInfo {
        self.inner.read().head()
    }

    fn contains(&self, hash: &Hash32) -> bool {
        self.inner.read().contains(hash)
    }

    fn header(&self, hash: &Hash32) -> Option<BlockHeader> {
        self.inner.read().header(hash).cloned()
    }

    fn has_body(&self, hash: &Hash32) -> bool {
        self.inner.read().has_body(hash)
    }

    fn is_canonical(&self, hash: &Hash32) -> bool {
        self.inner.read().is_canonical(hash)
    }

    fn in_safe_mode(&self) -> bool {
        self.inner.read().in_safe_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn genesis() -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            height: 0,
            parent: Hash32::ZERO,
            timestamp: 0,
            threshold: 1_000,
            weight: 0,
            policy_root: vec![0; 32],
            body_root: Hash32::ZERO,
            nonce: 0,
        }
    }

    fn child(parent: &BlockHeader, weight: u64, nonce: u64) -> BlockHeader {
        BlockHeader {
            height: parent.height + 1,
            parent: parent.hash(),
            timestamp: parent.timestamp + 1,
            weight,
            nonce,
            ..parent.clone()
        }
    }

    /// Extend `from` by `n` headers of `weight`, inserting each.
    fn grow(
        f: &mut Frontier,
        from: &BlockHeader,
        n: usize,
        weight: u64,
        nonce: u64,
        by: PeerId,
    ) -> (BlockHeader, Vec<Attach>) {
        let mut tip = from.clone();
        let mut outcomes = Vec::new();
        for _ in 0..n {
            tip = child(&tip, weight, nonce);
            outcomes.push(f.insert(tip.clone(), Some(by)).unwrap());
        }
        (tip, outcomes)
    }

    fn frontier(cfg: SyncConfig) -> (Frontier, BlockHeader) {
        let g = genesis();
        (Frontier::new(g.clone(), &cfg), g)
    }

    #[test]
    fn linear_extension() {
        let (mut f, g) = frontier(SyncConfig::default());
        let (tip, outcomes) = grow(&mut f, &g, 5, 1, 0, peer(1));
        assert!(outcomes.iter().all(|o| *o == Attach::Extended));
        assert_eq!(f.best(), tip.hash());
        assert_eq!(f.head().height, 5);
        assert_eq!(f.insert(tip, Some(peer(1))).unwrap(), Attach::Known);
    }

    #[test]
    fn unknown_parent_is_structural() {
        let (mut f, g) = frontier(SyncConfig::default());
        let mut orphan = child(&g, 1, 0);
        orphan.parent = Hash32([7; 32]);
        let err = f.insert(orphan, None).unwrap_err();
        assert_eq!(err.severity(), Severity::Structural);
    }

    #[test]
    fn heaviest_branch_wins_ties_go_to_lowest_hash() {
        let (mut f, g) = frontier(SyncConfig::default());
        let a = child(&g, 5, 1);
        let b = child(&g, 5, 2);
        f.insert(a.clone(), Some(peer(1))).unwrap();
        f.insert(b.clone(), Some(peer(2))).unwrap();
        let expected = a.hash().min(b.hash());
        assert_eq!(f.best(), expected);

        let heavier = child(&g, 6, 3);
        assert!(matches!(f.insert(heavier.clone(), Some(peer(3))).unwrap(), Attach::Reorg(_)));
        assert_eq!(f.best(), heavier.hash());
    }

    #[test]
    fn deep_reorg_needs_two_peers() {
        let (mut f, g) = frontier(SyncConfig::default());
        grow(&mut f, &g, 10, 1, 0, peer(1));

        // Competing branch, heavier, orphaning all ten, served by one peer.
        let (rival, outcomes) = grow(&mut f, &g, 10, 2, 9, peer(2));
        assert!(matches!(outcomes.last().unwrap(), Attach::Held { corroborating: 1, .. }));
        assert_ne!(f.best(), rival.hash());

        // A second peer serves the rival tip.
        match f.insert(rival.clone(), Some(peer(3))).unwrap() {
            Attach::Reorg(r) => {
                assert_eq!(r.depth, 10);
                assert_eq!(r.orphaned.len(), 10);
                assert_eq!(r.adopted.len(), 10);
                assert_eq!(r.fork_point, g.hash());
            }
            other => panic!("expected reorg, got {other:?}"),
        }
        assert_eq!(f.best(), rival.hash());
    }

    #[test]
    fn old_side_branches_are_pruned_but_held_branch_stays() {
        let (mut f, g) = frontier(SyncConfig::default());
        let (h2, _) = grow(&mut f, &g, 2, 2, 0, peer(1));
        let (tip, _) = grow(&mut f, &h2, 8, 2, 0, peer(1));
        let early = child(&g, 1, 7);
        let late = child(&h2, 1, 7);
        assert_eq!(f.insert(early.clone(), Some(peer(2))).unwrap(), Attach::SideBranch);
        assert_eq!(f.insert(late.clone(), Some(peer(2))).unwrap(), Attach::SideBranch);

        let (rival, outcomes) = grow(&mut f, &g, 10, 3, 9, peer(3));
        assert!(matches!(outcomes.last().unwrap(), Attach::Held { .. }));
        assert_eq!(f.len(), 1 + 10 + 2 + 10);

        assert_eq!(f.prune_side_branches(2), 1);
        assert!(!f.contains(&early.hash()));
        assert!(f.contains(&late.hash()));
        assert!(f.contains(&rival.hash()));
        assert_eq!(f.best(), tip.hash());
        assert_eq!(f.head().height, 10);
        assert_eq!(f.prune_side_branches(2), 0);
    }

    #[test]
    fn shallow_reorg_needs_no_corroboration() {
        let (mut f, g) = frontier(SyncConfig::default());
        grow(&mut f, &g, 3, 1, 0, peer(1));
        let (_, outcomes) = grow(&mut f, &g, 3, 2, 9, peer(2));
        assert!(outcomes.iter().any(|o| matches!(o, Attach::Reorg(r) if r.depth <= 3)));
    }

    fn shallow_hard_cfg(late: bool) -> SyncConfig {
        SyncConfig {
            soft_reorg_depth: 2,
            hard_reorg_depth: 4,
            late_finalization: late,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn beyond_hard_depth_enters_safe_mode_until_operator_exit() {
        let (mut f, g) = frontier(shallow_hard_cfg(false));
        let (main_tip, _) = grow(&mut f, &g, 6, 1, 0, peer(1));
        let (rival, _) = grow(&mut f, &g, 6, 2, 9, peer(2));
        let out = f.insert(rival.clone(), Some(peer(3))).unwrap();
        assert!(matches!(out, Attach::Known | Attach::SafeMode(_)));
        assert!(f.in_safe_mode());
        assert_eq!(f.best(), main_tip.hash());

        let reorg = f.exit_safe_mode().unwrap().unwrap();
        assert_eq!(reorg.new_tip, rival.hash());
        assert!(!f.in_safe_mode());
        assert_eq!(f.exit_safe_mode(), Err(FrontierError::NotInSafeMode));
    }

    #[test]
    fn late_finalization_adopts_corroborated_deep_branch() {
        let (mut f, g) = frontier(shallow_hard_cfg(true));
        grow(&mut f, &g, 6, 1, 0, peer(1));
        let (rival, _) = grow(&mut f, &g, 6, 2, 9, peer(2));
        assert!(!f.in_safe_mode());
        assert!(matches!(f.insert(rival.clone(), Some(peer(3))).unwrap(), Attach::Reorg(_)));
        assert_eq!(f.best(), rival.hash());
    }

    #[test]
    fn locator_and_serving() {
        let (mut f, g) = frontier(SyncConfig::default());
        let (tip, _) = grow(&mut f, &g, 50, 1, 0, peer(1));
        let locator = f.locator();
        assert_eq!(locator[0], tip.hash());
        assert_eq!(*locator.last().unwrap(), g.hash());

        let from_genesis = f.headers_after(&[g.hash()], &Hash32::ZERO, 20);
        assert_eq!(from_genesis.len(), 20);
        assert_eq!(from_genesis[0].height, 1);

        let stop = f.canonical_at(5).unwrap();
        assert_eq!(f.headers_after(&[g.hash()], &stop, 20).len(), 5);
        assert!(f.headers_after(&[tip.hash()], &Hash32::ZERO, 20).is_empty());
    }

    #[test]
    fn missing_bodies_ascend_and_shrink() {
        let (mut f, g) = frontier(SyncConfig::default());
        grow(&mut f, &g, 4, 1, 0, peer(1));
        let missing = f.missing_bodies(10);
        assert_eq!(missing.iter().map(|(h, _)| *h).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        f.mark_body(&missing[0].1).unwrap();
        assert_eq!(f.missing_bodies(10).len(), 3);
    }
}
