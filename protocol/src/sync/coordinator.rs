//! # Sync Coordinator
//!
//! Single writer of sync state: the frontier, the orphan pool, the body
//! fetcher and the relays. Every handler takes the message and the current
//! instant and returns the [`SyncAction`]s the network layer should carry
//! out; notifications for the rest of the node queue up as [`SyncEvent`]s
//! and are collected with [`SyncCoordinator::take_events`].
//!
//! Handlers that judge a single unit (a `headers` run, one gossiped header,
//! one tx) return `Err` and leave the penalty to the caller. Handlers that
//! judge many units at once (`blocks`, `data`) report each failure as a
//! [`SyncAction::Penalize`] and carry on with the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::{unix_now, MAX_BLOCK_BYTES};
use crate::error::Severity;
use crate::gossip::{GossipConfig, PeerScoreTable, Topic};
use crate::metrics::P2pMetrics;
use crate::sync::chain_view::{BlockSource, ChainView, ConsensusView};
use crate::sync::fetch::{BodyFetcher, FetchRequest};
use crate::sync::frontier::{Attach, Frontier, FrontierView, Reorg, SafeMode};
use crate::sync::header::{
    check_against_parent, check_contiguous, check_standalone, HeaderError, HeaderRules,
};
use crate::sync::orphans::OrphanPool;
use crate::sync::relay::{RelayConfig, RelayReject, ShareRelay, TxRelay};
use crate::sync::suspect::SuspectHeaders;
use crate::sync::{SyncConfig, SyncError, SyncRequest};
use crate::types::{Hash32, PeerId};
use crate::wire::messages::{
    Blocks, Data, GetBlocks, GetHeaders, Headers, InvItem, InvKind, InvList, Message, NewHead,
};
use crate::wire::objects::{BlockBody, BlockHeader, ShareEnvelope, TxEnvelope};

/// Something the network layer should do.
#[derive(Debug)]
pub enum SyncAction {
    Send { peer: PeerId, message: Message },
    /// A hedged body request. Send `request.to_message()` to `request.peer`
    /// unless every item has been settled in the meantime.
    Fetch(FetchRequest),
    /// Charge the peer for a bad response.
    Penalize { peer: PeerId, error: SyncError },
    /// Reward a useful response.
    Credit { peer: PeerId },
    /// Forget these gossip ids so the content counts as fresh again.
    Invalidate { topic: Topic, ids: Vec<Hash32> },
}

/// What sync tells the rest of the node.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Newly canonical headers, in chain order.
    HeadersAccepted(Vec<BlockHeader>),
    /// A structurally valid body. Consensus has only previewed it.
    Body {
        header: BlockHeader,
        body: BlockBody,
        verified: bool,
    },
    Tx {
        id: Hash32,
        tx: TxEnvelope,
        from: PeerId,
    },
    Share {
        id: Hash32,
        share: ShareEnvelope,
        from: PeerId,
    },
    Reorg(Reorg),
    SafeModeEntered(SafeMode),
    SafeModeExited { adopted: Option<Reorg> },
}

#[derive(Debug, Clone)]
struct PeerSync {
    head_height: u64,
    head_hash: Hash32,
    /// Deadline of the outstanding `getheaders`, if any.
    headers_due: Option<Instant>,
}

/// Tx ids of imported bodies, kept so a reorg can hand them back to relay.
struct ImportedTxs {
    by_block: HashMap<Hash32, (u64, Vec<Hash32>)>,
}

impl ImportedTxs {
    fn take(&mut self, blocks: &[Hash32]) -> Vec<Hash32> {
        blocks
            .iter()
            .filter_map(|h| self.by_block.remove(h))
            .flat_map(|(_, ids)| ids)
            .collect()
    }

    fn collect(&self, blocks: &[Hash32]) -> Vec<Hash32> {
        blocks
            .iter()
            .filter_map(|h| self.by_block.get(h))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    fn prune_below(&mut self, height: u64) {
        self.by_block.retain(|_, (h, _)| *h >= height);
    }
}

pub struct SyncCoordinator {
    cfg: SyncConfig,
    chain_id: u64,
    frontier: Arc<RwLock<Frontier>>,
    orphans: OrphanPool,
    /// Headers that broke the threshold step, waiting for corroboration.
    suspects: SuspectHeaders,
    fetcher: BodyFetcher,
    txs: TxRelay,
    shares: ShareRelay,
    consensus: Arc<dyn ConsensusView>,
    source: Option<Arc<dyn BlockSource>>,
    scores: Option<Arc<PeerScoreTable>>,
    metrics: Option<Arc<P2pMetrics>>,
    peers: HashMap<PeerId, PeerSync>,
    imported: ImportedTxs,
    backpressure: bool,
    /// Set once `SafeModeEntered` has been emitted for the current episode.
    safe_mode_reported: bool,
    events: Vec<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        cfg: &SyncConfig,
        relay: &RelayConfig,
        gossip: &GossipConfig,
        genesis: BlockHeader,
        consensus: Arc<dyn ConsensusView>,
        now: Instant,
    ) -> Self {
        let chain_id = genesis.chain_id;
        Self {
            cfg: cfg.clone(),
            chain_id,
            frontier: Arc::new(RwLock::new(Frontier::new(genesis, cfg))),
            orphans: OrphanPool::new(cfg.orphan_ttl(), cfg.max_orphans),
            suspects: SuspectHeaders::new(
                cfg.min_corroborating_peers,
                cfg.suspect_ttl(),
                cfg.max_suspects,
            ),
            fetcher: BodyFetcher::new(cfg),
            txs: TxRelay::new(relay, gossip, chain_id, now),
            shares: ShareRelay::new(relay, gossip, now),
            consensus,
            source: None,
            scores: None,
            metrics: None,
            peers: HashMap::new(),
            imported: ImportedTxs {
                by_block: HashMap::new(),
            },
            backpressure: false,
            safe_mode_reported: false,
            events: Vec::new(),
        }
    }

    pub fn with_block_source(mut self, source: Arc<dyn BlockSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Score table used to rank announcers for body fetches.
    pub fn with_scores(mut self, scores: Arc<PeerScoreTable>) -> Self {
        self.scores = Some(scores);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<P2pMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Read-only view for gossip and the node's status endpoint.
    pub fn chain_view(&self) -> Arc<dyn ChainView> {
        Arc::new(FrontierView::new(self.frontier.clone()))
    }

    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// A peer finished identify. Starts header sync if it claims anything
    /// we lack.
    pub fn on_peer_ready(
        &mut self,
        peer: PeerId,
        head_height: u64,
        head_hash: Hash32,
        now: Instant,
    ) -> Vec<SyncAction> {
        let entry = self.peers.entry(peer).or_insert(PeerSync {
            head_height,
            head_hash,
            headers_due: None,
        });
        entry.head_height = head_height;
        entry.head_hash = head_hash;
        debug!(peer = %peer.short(), head_height, "sync peer ready");
        let mut actions = Vec::new();
        if !self.frontier.read().contains(&head_hash) {
            actions.extend(self.request_headers(peer, now));
        }
        actions
    }

    pub fn on_peer_closed(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.fetcher.peer_gone(peer);
        self.txs.peer_gone(peer);
        self.shares.peer_gone(peer);
    }

    pub fn is_ready(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    fn require_ready(&self, peer: &PeerId) -> Result<(), SyncError> {
        if self.peers.contains_key(peer) {
            Ok(())
        } else {
            Err(SyncError::NotReady(*peer))
        }
    }

    /// A peer announced a new head.
    pub fn on_new_head(
        &mut self,
        peer: PeerId,
        head: &NewHead,
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        self.require_ready(&peer)?;
        if let Some(p) = self.peers.get_mut(&peer) {
            if head.height >= p.head_height {
                p.head_height = head.height;
                p.head_hash = head.hash;
            }
        }
        if self.frontier.read().contains(&head.hash) {
            self.frontier.write().add_announcer(&head.hash, peer);
            return Ok(Vec::new());
        }
        Ok(self.request_headers(peer, now).into_iter().collect())
    }

    fn request_headers(&mut self, peer: PeerId, now: Instant) -> Option<SyncAction> {
        let timeout = self.cfg.fetch_timeout();
        let p = self.peers.get_mut(&peer)?;
        if p.headers_due.is_some_and(|due| due > now) {
            return None;
        }
        p.headers_due = Some(now + timeout);
        let locator = self.frontier.read().locator();
        trace!(peer = %peer.short(), entries = locator.len(), "requesting headers");
        Some(SyncAction::Send {
            peer,
            message: Message::GetHeaders(GetHeaders {
                locator,
                stop: Hash32::ZERO,
                max: self.cfg.header_batch as u32,
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Headers
    // -----------------------------------------------------------------------

    fn rules(&self) -> HeaderRules {
        HeaderRules {
            chain_id: self.chain_id,
            policy_root: self.consensus.policy_root(),
            max_clock_skew_secs: self.cfg.max_clock_skew().as_secs(),
            now_unix: unix_now(),
        }
    }

    /// A `headers` response: one contiguous run attaching to a known header.
    pub fn on_headers(
        &mut self,
        peer: PeerId,
        msg: Headers,
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        self.require_ready(&peer)?;
        if let Some(p) = self.peers.get_mut(&peer) {
            p.headers_due = None;
        }
        let headers = msg.headers;
        if headers.is_empty() {
            return Ok(Vec::new());
        }
        if headers.len() > self.cfg.max_headers_per_message {
            return Err(HeaderError::TooMany {
                count: headers.len(),
                max: self.cfg.max_headers_per_message,
            }
            .into());
        }
        check_contiguous(&headers)?;
        let rules = self.rules();
        for h in &headers {
            check_standalone(h, &rules)?;
        }
        let first_parent = self
            .frontier
            .read()
            .header(&headers[0].parent)
            .cloned()
            .ok_or(HeaderError::UnknownParent(headers[0].parent))?;
        // The run is attached up to the first header that breaks the
        // threshold step; that one is held, the rest wait on it.
        let mut suspect_at = None;
        for (i, header) in headers.iter().enumerate() {
            let parent = if i == 0 { &first_parent } else { &headers[i - 1] };
            match check_against_parent(header, parent, &rules) {
                Ok(()) => {}
                Err(e) if e.severity() == Severity::Consistency => {
                    suspect_at = Some(i);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let full_batch = headers.len() >= self.cfg.header_batch && suspect_at.is_none();
        let count = headers.len();
        let mut headers = headers;
        let held = suspect_at.map(|i| headers.split_off(i)).unwrap_or_default();
        let mut actions = Vec::new();
        let mut accepted = Vec::new();
        for header in headers {
            self.attach(header, peer, now, &mut actions, &mut accepted)?;
        }
        let mut held = held.into_iter();
        if let Some(suspect) = held.next() {
            for waiting in held {
                self.orphans.insert(waiting, peer, now);
            }
            self.hold_suspect(suspect, peer, now, &mut actions, &mut accepted);
        }
        debug!(peer = %peer.short(), count, canonical = accepted.len(), "headers processed");
        self.finish_headers(accepted);

        actions.push(SyncAction::Credit { peer });
        if full_batch {
            actions.extend(self.request_headers(peer, now));
        }
        actions.extend(self.schedule_fetches(now));
        Ok(actions)
    }

    /// A header that arrived over gossip (or `newblock`) and passed the
    /// gossip pipeline. Unknown parents park it in the orphan pool.
    pub fn on_gossip_header(
        &mut self,
        peer: PeerId,
        header: BlockHeader,
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let rules = self.rules();
        check_standalone(&header, &rules)?;
        let parent = self.frontier.read().header(&header.parent).cloned();
        let mut actions = Vec::new();
        match parent {
            Some(parent) => {
                let mut accepted = Vec::new();
                match check_against_parent(&header, &parent, &rules) {
                    Ok(()) => self.attach(header, peer, now, &mut actions, &mut accepted)?,
                    Err(e) if e.severity() == Severity::Consistency => {
                        self.hold_suspect(header, peer, now, &mut actions, &mut accepted)
                    }
                    Err(e) => return Err(e.into()),
                }
                self.finish_headers(accepted);
                actions.extend(self.schedule_fetches(now));
            }
            None => {
                let height = header.height;
                if self.orphans.insert(header, peer, now) {
                    trace!(peer = %peer.short(), height, "header parked as orphan");
                }
                actions.extend(self.request_headers(peer, now));
            }
        }
        Ok(actions)
    }

    /// Hold a header that broke the threshold step. Once enough distinct
    /// peers have served it, it attaches like any other.
    fn hold_suspect(
        &mut self,
        header: BlockHeader,
        peer: PeerId,
        now: Instant,
        actions: &mut Vec<SyncAction>,
        accepted: &mut Vec<BlockHeader>,
    ) {
        if self.frontier.read().contains(&header.hash()) {
            self.frontier.write().add_announcer(&header.hash(), peer);
            return;
        }
        let Some(released) = self.suspects.vouch(header, peer, now) else {
            return;
        };
        let hash = released.header.hash();
        let first = released.announcers.first().copied().unwrap_or(peer);
        if let Err(e) = self.attach(released.header, first, now, actions, accepted) {
            debug!(header = %hash.short(), error = %e, "corroborated header did not attach");
            return;
        }
        let mut frontier = self.frontier.write();
        for p in &released.announcers {
            frontier.add_announcer(&hash, *p);
        }
    }

    /// Insert one checked header, then any orphans it releases.
    fn attach(
        &mut self,
        header: BlockHeader,
        peer: PeerId,
        now: Instant,
        actions: &mut Vec<SyncAction>,
        accepted: &mut Vec<BlockHeader>,
    ) -> Result<(), SyncError> {
        let rules = self.rules();
        let mut work = vec![(header, peer)];
        let mut first = true;
        while let Some((header, from)) = work.pop() {
            let hash = header.hash();
            let result = self.frontier.write().insert(header.clone(), Some(from));
            let attach = match result {
                Ok(a) => a,
                // Only the caller's own header is the sender's fault.
                Err(e) if first => return Err(e.into()),
                Err(e) => {
                    debug!(error = %e, "released orphan did not attach");
                    continue;
                }
            };
            first = false;
            self.apply_attach(attach, &header, now, actions, accepted);
            for (child, child_from) in self.orphans.take_children(&hash) {
                if check_against_parent(&child, &header, &rules).is_ok() {
                    work.push((child, child_from));
                }
            }
        }
        Ok(())
    }

    fn apply_attach(
        &mut self,
        attach: Attach,
        header: &BlockHeader,
        now: Instant,
        actions: &mut Vec<SyncAction>,
        accepted: &mut Vec<BlockHeader>,
    ) {
        match attach {
            Attach::Known | Attach::SideBranch => {}
            Attach::Extended => accepted.push(header.clone()),
            Attach::Held {
                candidate,
                depth,
                corroborating,
            } => {
                trace!(candidate = %candidate.short(), depth, corroborating, "branch held");
            }
            Attach::SafeMode(mode) => {
                if !self.safe_mode_reported {
                    self.safe_mode_reported = true;
                    self.events.push(SyncEvent::SafeModeEntered(mode));
                }
                if let Some(m) = &self.metrics {
                    m.safe_mode.set(1);
                }
            }
            Attach::Reorg(reorg) => self.apply_reorg(reorg, now, actions, accepted),
        }
    }

    fn apply_reorg(
        &mut self,
        reorg: Reorg,
        now: Instant,
        actions: &mut Vec<SyncAction>,
        accepted: &mut Vec<BlockHeader>,
    ) {
        // Headers orphaned inside this same batch never reached the caller.
        accepted.retain(|h| !reorg.orphaned.contains(&h.hash()));
        {
            let frontier = self.frontier.read();
            accepted.extend(
                reorg
                    .adopted
                    .iter()
                    .filter_map(|h| frontier.header(h).cloned()),
            );
        }

        let orphaned_txs = self.imported.take(&reorg.orphaned);
        let adopted_txs = self.imported.collect(&reorg.adopted);
        self.txs.on_reorg(&orphaned_txs, &adopted_txs, now);

        let gone: HashSet<Hash32> = reorg.orphaned.iter().copied().collect();
        let purged = self.orphans.purge(&gone);
        let cancelled = self.fetcher.purge(&gone);
        info!(
            depth = reorg.depth,
            orphaned = reorg.orphaned.len(),
            txs = orphaned_txs.len(),
            purged,
            cancelled,
            "reorg applied"
        );

        actions.push(SyncAction::Invalidate {
            topic: Topic::Headers,
            ids: reorg.orphaned.clone(),
        });
        if !orphaned_txs.is_empty() {
            actions.push(SyncAction::Invalidate {
                topic: Topic::Tx,
                ids: orphaned_txs,
            });
        }
        if let Some(m) = &self.metrics {
            m.reorgs.inc();
        }
        self.events.push(SyncEvent::Reorg(reorg));
    }

    fn finish_headers(&mut self, accepted: Vec<BlockHeader>) {
        if accepted.is_empty() {
            return;
        }
        if let Some(m) = &self.metrics {
            m.headers_accepted.inc_by(accepted.len() as u64);
            m.head_height.set(self.frontier.read().head().height as i64);
        }
        self.events.push(SyncEvent::HeadersAccepted(accepted));
    }

    /// Serve a `getheaders` from the canonical chain.
    pub fn on_get_headers(&self, peer: PeerId, req: &GetHeaders) -> Vec<SyncAction> {
        let max = (req.max as usize).min(self.cfg.max_headers_per_message);
        let headers = self.frontier.read().headers_after(&req.locator, &req.stop, max);
        trace!(peer = %peer.short(), served = headers.len(), "serving headers");
        vec![SyncAction::Send {
            peer,
            message: Message::Headers(Headers { headers }),
        }]
    }

    // -----------------------------------------------------------------------
    // Bodies
    // -----------------------------------------------------------------------

    /// Serve a `getblocks` from the block source. Unknown bodies are listed
    /// in a `notfound`.
    pub fn on_get_blocks(&self, peer: PeerId, req: &GetBlocks) -> Vec<SyncAction> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for hash in req.hashes.iter().take(self.cfg.max_blocks_per_request) {
            match self.source.as_ref().and_then(|s| s.body(hash)) {
                Some(body) => found.push(body),
                None => missing.push(InvItem {
                    kind: InvKind::Block,
                    id: *hash,
                }),
            }
        }
        let mut actions = Vec::new();
        if !found.is_empty() {
            actions.push(SyncAction::Send {
                peer,
                message: Message::Blocks(Blocks { blocks: found }),
            });
        }
        if !missing.is_empty() {
            actions.push(SyncAction::Send {
                peer,
                message: Message::NotFound(InvList { items: missing }),
            });
        }
        actions
    }

    /// A `blocks` response.
    pub fn on_blocks(&mut self, peer: PeerId, msg: Blocks, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        if let Err(error) = self.require_ready(&peer) {
            actions.push(SyncAction::Penalize { peer, error });
            return actions;
        }
        let mut imported = 0usize;
        for body in msg.blocks {
            let hash = body.header_hash;
            match self.import_body(peer, body, now) {
                Ok(true) => imported += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(peer = %peer.short(), block = %hash.short(), %error, "body rejected");
                    actions.push(SyncAction::Penalize { peer, error });
                }
            }
        }
        if imported > 0 {
            actions.push(SyncAction::Credit { peer });
        }
        actions.extend(self.schedule_fetches(now));
        actions
    }

    /// A `notfound` for bodies we asked for.
    pub fn on_not_found(&mut self, peer: PeerId, msg: &InvList, now: Instant) -> Vec<SyncAction> {
        for item in msg.items.iter().filter(|i| i.kind == InvKind::Block) {
            self.fetcher.fail(&item.id, &peer);
        }
        self.schedule_fetches(now)
    }

    fn import_body(
        &mut self,
        peer: PeerId,
        body: BlockBody,
        now: Instant,
    ) -> Result<bool, SyncError> {
        let hash = body.header_hash;
        let (header, has_body, safe_mode) = {
            let frontier = self.frontier.read();
            (
                frontier.header(&hash).cloned(),
                frontier.has_body(&hash),
                frontier.in_safe_mode(),
            )
        };
        // Late hedged copy.
        if has_body {
            return Ok(false);
        }
        if !self.fetcher.is_outstanding(&hash, &peer) {
            return Err(SyncError::Unsolicited(hash));
        }
        let Some(header) = header else {
            self.fetcher.fail(&hash, &peer);
            return Err(SyncError::Unsolicited(hash));
        };
        if safe_mode {
            self.fetcher.fail(&hash, &peer);
            return Ok(false);
        }

        let len: usize = body.txs.iter().map(|t| t.len()).sum::<usize>()
            + body.proofs.iter().map(|p| p.len()).sum::<usize>();
        let checked = if len > MAX_BLOCK_BYTES {
            Err(SyncError::BodyTooLarge { hash, len })
        } else if body.root() != header.body_root {
            Err(SyncError::BodyRootMismatch(hash))
        } else {
            self.consensus
                .preview_body(&header, &body)
                .map_err(|reason| SyncError::BodyRejected { hash, reason })
        };
        if let Err(e) = checked {
            self.fetcher.fail(&hash, &peer);
            return Err(e);
        }

        self.fetcher.complete(&hash);
        self.frontier.write().mark_body(&hash)?;
        let tx_ids = body.tx_ids();
        for id in &tx_ids {
            self.txs.note_seen(*id, None, now);
        }
        self.imported.by_block.insert(hash, (header.height, tx_ids));
        if let Some(m) = &self.metrics {
            m.bodies_imported.inc();
        }
        trace!(peer = %peer.short(), height = header.height, "body imported");
        self.events.push(SyncEvent::Body {
            header,
            body,
            verified: false,
        });
        Ok(true)
    }

    fn schedule_fetches(&mut self, now: Instant) -> Vec<SyncAction> {
        if self.frontier.read().in_safe_mode() || self.peers.is_empty() {
            return Vec::new();
        }
        let window =
            self.cfg.max_blocks_per_request * self.cfg.hedge_fanout.max(1) * self.peers.len();
        let missing = self.frontier.write().missing_bodies(window);
        for (height, hash) in missing {
            if self.fetcher.is_tracked(&hash) {
                continue;
            }
            let mut candidates: Vec<PeerId> = self
                .frontier
                .read()
                .announcers(&hash)
                .into_iter()
                .filter(|p| self.peers.contains_key(p))
                .collect();
            candidates.extend(
                self.peers
                    .iter()
                    .filter(|(_, s)| s.head_height >= height)
                    .map(|(p, _)| *p),
            );
            if candidates.is_empty() {
                continue;
            }
            self.fetcher.enqueue(hash, height, candidates);
        }

        let limit = if self.backpressure {
            (self.cfg.max_in_flight_per_peer / 2).max(1)
        } else {
            self.cfg.max_in_flight_per_peer
        };
        let scores = self.scores.clone();
        let score = move |p: &PeerId| scores.as_ref().map_or(0.0, |s| s.score(p));
        self.fetcher
            .schedule(now, &score, limit)
            .into_iter()
            .map(SyncAction::Fetch)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Inventory relay
    // -----------------------------------------------------------------------

    /// An `inv`. Returns the `getdata` for ids worth fetching, and starts
    /// header sync for unknown blocks.
    pub fn on_inv(
        &mut self,
        peer: PeerId,
        inv: &InvList,
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        self.require_ready(&peer)?;
        let max = crate::config::MAX_INV_ITEMS;
        if inv.items.len() > max {
            return Err(RelayReject::TooManyItems {
                count: inv.items.len(),
                max,
            }
            .into());
        }
        let mut tx_ids = Vec::new();
        let mut share_ids = Vec::new();
        let mut unknown_block = false;
        for item in &inv.items {
            match item.kind {
                InvKind::Tx => tx_ids.push(item.id),
                InvKind::Share => share_ids.push(item.id),
                InvKind::Block => {
                    let mut frontier = self.frontier.write();
                    if frontier.contains(&item.id) {
                        frontier.add_announcer(&item.id, peer);
                        drop(frontier);
                        self.fetcher.add_candidate(item.id, peer);
                    } else {
                        unknown_block = true;
                    }
                }
                InvKind::Blob => {}
            }
        }

        let mut wanted: Vec<InvItem> = self
            .txs
            .on_announce(peer, &tx_ids, now)?
            .into_iter()
            .map(|id| InvItem { kind: InvKind::Tx, id })
            .collect();
        wanted.extend(
            self.shares
                .on_announce(peer, &share_ids, now)?
                .into_iter()
                .map(|id| InvItem {
                    kind: InvKind::Share,
                    id,
                }),
        );

        let mut actions = Vec::new();
        if !wanted.is_empty() {
            actions.push(SyncAction::Send {
                peer,
                message: Message::GetData(InvList { items: wanted }),
            });
        }
        if unknown_block {
            actions.extend(self.request_headers(peer, now));
        }
        Ok(actions)
    }

    /// A `data` response: each item goes to its relay.
    pub fn on_data(&mut self, peer: PeerId, data: Data, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        for item in data.items {
            let result = match item.kind {
                InvKind::Tx => self.on_tx(peer, item.id, &item.body, now),
                InvKind::Share => self.on_share(peer, item.id, &item.body, now),
                InvKind::Block | InvKind::Blob => continue,
            };
            match result {
                Ok(more) => actions.extend(more),
                Err(SyncError::Relay(RelayReject::Unsolicited(id))) => {
                    trace!(peer = %peer.short(), id = %id.short(), "unsolicited data item");
                }
                Err(error) => actions.push(SyncAction::Penalize { peer, error }),
            }
        }
        actions
    }

    /// One requested tx body.
    pub fn on_tx(
        &mut self,
        peer: PeerId,
        id: Hash32,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let Some(tx) = self.txs.on_data(peer, id, raw, now)? else {
            return Ok(Vec::new());
        };
        let ready: Vec<PeerId> = self.peers.keys().filter(|p| **p != peer).copied().collect();
        let targets = self.txs.announce_targets(id, &ready, now);
        self.events.push(SyncEvent::Tx { id, tx, from: peer });
        Ok(self.announce(InvKind::Tx, id, peer, targets))
    }

    /// One requested share.
    pub fn on_share(
        &mut self,
        peer: PeerId,
        id: Hash32,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let threshold = self.consensus.current_threshold();
        let Some(share) = self.shares.on_data(peer, id, raw, threshold, unix_now(), now)? else {
            return Ok(Vec::new());
        };
        let ready: Vec<PeerId> = self.peers.keys().filter(|p| **p != peer).copied().collect();
        let targets = self.shares.announce_targets(id, &ready, now);
        self.events.push(SyncEvent::Share {
            id,
            share,
            from: peer,
        });
        Ok(self.announce(InvKind::Share, id, peer, targets))
    }

    /// Record a tx or share that arrived over gossip so the inventory path
    /// neither requests nor re-announces it to the sender.
    pub fn note_gossiped(&mut self, kind: InvKind, id: Hash32, from: PeerId, now: Instant) {
        match kind {
            InvKind::Tx => {
                self.txs.note_seen(id, Some(from), now);
            }
            InvKind::Share => {
                self.shares.note_seen(id, Some(from), now);
            }
            InvKind::Block | InvKind::Blob => {}
        }
    }

    fn announce(
        &self,
        kind: InvKind,
        id: Hash32,
        from: PeerId,
        targets: Vec<PeerId>,
    ) -> Vec<SyncAction> {
        let mut actions = vec![SyncAction::Credit { peer: from }];
        actions.extend(targets.into_iter().map(|peer| SyncAction::Send {
            peer,
            message: Message::Inv(InvList {
                items: vec![InvItem { kind, id }],
            }),
        }));
        actions
    }

    // -----------------------------------------------------------------------
    // Requests, timers, operator
    // -----------------------------------------------------------------------

    pub fn on_request(&mut self, req: SyncRequest, now: Instant) -> Vec<SyncAction> {
        match req {
            SyncRequest::MissingParent { peer, parent, height } => {
                if self.frontier.read().contains(&parent) {
                    return Vec::new();
                }
                trace!(peer = %peer.short(), parent = %parent.short(), height, "missing parent");
                self.request_headers(peer, now).into_iter().collect()
            }
            SyncRequest::SuspectHeader { peer, header } => {
                match self.on_gossip_header(peer, header, now) {
                    Ok(actions) => actions,
                    Err(error) => vec![SyncAction::Penalize { peer, error }],
                }
            }
            SyncRequest::Backpressure(on) => {
                if on != self.backpressure {
                    info!(backpressure = on, "fetch concurrency adjusted");
                }
                self.backpressure = on;
                Vec::new()
            }
        }
    }

    /// Periodic housekeeping: expire orphans, fetches and relay state,
    /// re-request missing parents, and top up body fetches.
    pub fn tick(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        let expired = self.orphans.expire(now);
        if expired > 0 {
            debug!(expired, "orphans expired");
        }
        let needed = self.suspects.quorum();
        for stale in self.suspects.expire(now) {
            debug!(
                header = %stale.hash.short(),
                announcers = stale.announcers.len(),
                "suspect header expired uncorroborated"
            );
            self.orphans.purge(&HashSet::from([stale.hash]));
            for peer in stale.announcers.iter().copied() {
                actions.push(SyncAction::Penalize {
                    peer,
                    error: SyncError::Uncorroborated {
                        hash: stale.hash,
                        announcers: stale.announcers.len(),
                        needed,
                    },
                });
            }
        }
        for (_, peer, _) in self.orphans.missing_parents() {
            if self.peers.contains_key(&peer) {
                actions.extend(self.request_headers(peer, now));
            }
        }

        let timeouts = self.fetcher.expire(now);
        if let Some(m) = &self.metrics {
            m.fetch_timeouts.inc_by(timeouts.timed_out.len() as u64);
        }
        for hash in &timeouts.abandoned {
            warn!(block = %hash.short(), "body fetch abandoned");
        }

        self.txs.expire(now);
        self.shares.expire(now);

        // Peers ahead of us with no outstanding request.
        let head = self.frontier.read().head();
        let behind: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.head_height > head.height && p.headers_due.map_or(true, |d| d <= now)
            })
            .map(|(id, _)| *id)
            .collect();
        for peer in behind {
            let known = self
                .peers
                .get(&peer)
                .is_some_and(|p| self.frontier.read().contains(&p.head_hash));
            if !known {
                actions.extend(self.request_headers(peer, now));
            }
        }

        let floor = head.height.saturating_sub(self.cfg.hard_reorg_depth.saturating_mul(2));
        self.imported.prune_below(floor);
        self.frontier.write().prune_side_branches(floor);

        if let Some(m) = &self.metrics {
            m.orphans.set(self.orphans.len() as i64);
            m.head_height.set(head.height as i64);
            m.safe_mode.set(i64::from(self.frontier.read().in_safe_mode()));
        }

        actions.extend(self.schedule_fetches(now));
        actions
    }

    /// Operator intervention: leave safe mode and resume body import.
    pub fn exit_safe_mode(&mut self, now: Instant) -> Result<Vec<SyncAction>, SyncError> {
        let adopted = self.frontier.write().exit_safe_mode()?;
        let mut actions = Vec::new();
        let mut accepted = Vec::new();
        if let Some(reorg) = adopted.clone() {
            self.apply_reorg(reorg, now, &mut actions, &mut accepted);
        }
        self.finish_headers(accepted);
        self.safe_mode_reported = false;
        self.events.push(SyncEvent::SafeModeExited { adopted });
        if let Some(m) = &self.metrics {
            m.safe_mode.set(0);
        }
        actions.extend(self.schedule_fetches(now));
        Ok(actions)
    }

    pub fn in_safe_mode(&self) -> bool {
        self.frontier.read().in_safe_mode()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Headers waiting for corroboration.
    pub fn suspect_count(&self) -> usize {
        self.suspects.len()
    }

    pub fn backpressure(&self) -> bool {
        self.backpressure
    }

    pub fn ready_peers(&self) -> usize {
        self.peers.len()
    }

    /// Bodies queued or in flight.
    pub fn fetches_tracked(&self) -> usize {
        self.fetcher.tracked()
    }
}
