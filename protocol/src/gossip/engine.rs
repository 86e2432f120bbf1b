//! # Gossip Engine
//!
//! Glue between the pipeline stages, the mesh and the score table. The
//! engine does no I/O: the network layer hands it envelopes and control
//! messages and receives back verdicts, control commands and forward lists.
//!
//! Locks are short and never nested across stages: each dedup window has its
//! own mutex, the mesh has one, and scores and buckets live in sharded maps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{unix_now, P2pConfig};
use crate::crypto::hash::digest8;
use crate::gossip::validate::{cheap_check, CheckContext};
use crate::gossip::{
    Admission, ControlCommand, DedupWindow, GossipConfig, GossipObject, GossipReject,
    GraftOutcome, Mesh, PeerScoreTable, RateLimiter, SampleResult, SamplingPool, ScoreEvent,
    Standing, Topic,
};
use crate::metrics::P2pMetrics;
use crate::sync::chain_view::{ChainView, ConsensusView};
use crate::sync::SyncRequest;
use crate::types::{Hash32, PeerId};
use crate::wire::messages::{GossipEnvelope, Prune, TopicList};

/// What to do with an inbound gossip message.
#[derive(Debug, Clone)]
pub enum GossipVerdict {
    /// Passed stages 1 to 5. Forward the original envelope to `forward`.
    Accepted {
        topic: Topic,
        id: Hash32,
        object: GossipObject,
        forward: Vec<PeerId>,
    },
    /// Not forwarded. `disconnect` is set when the sender is now banned.
    Dropped {
        reason: GossipReject,
        disconnect: bool,
    },
}

impl GossipVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// A locally originated message, ready to send.
#[derive(Debug, Clone)]
pub struct Published {
    pub id: Hash32,
    pub envelope: GossipEnvelope,
    pub targets: Vec<PeerId>,
}

/// Work produced by one heartbeat.
#[derive(Debug, Default)]
pub struct HeartbeatOutput {
    pub control: Vec<ControlCommand>,
    /// Banned peers that are still connected.
    pub disconnect: Vec<PeerId>,
    pub backpressure: bool,
}

pub struct GossipEngine {
    cfg: GossipConfig,
    chain_id: u64,
    scores: Arc<PeerScoreTable>,
    limiter: RateLimiter,
    dedup: HashMap<Topic, Mutex<DedupWindow>>,
    mesh: Mutex<Mesh>,
    consensus: Arc<dyn ConsensusView>,
    chain: Arc<dyn ChainView>,
    sampler: Option<SamplingPool>,
    sync_requests: Option<mpsc::Sender<SyncRequest>>,
    metrics: Option<Arc<P2pMetrics>>,
    last_heartbeat: Mutex<Instant>,
    last_backpressure: Mutex<bool>,
    /// Largest `data` any topic accepts; the first size gate.
    max_data_len: usize,
}

impl GossipEngine {
    pub fn new(
        config: &P2pConfig,
        chain_id: u64,
        consensus: Arc<dyn ConsensusView>,
        chain: Arc<dyn ChainView>,
        now: Instant,
    ) -> Self {
        let dedup = Topic::ALL
            .into_iter()
            .map(|t| (t, Mutex::new(DedupWindow::from_config(&config.gossip, now))))
            .collect();
        let max_data_len = Topic::ALL
            .into_iter()
            .map(Topic::max_data_len)
            .max()
            .unwrap_or(0);
        Self {
            cfg: config.gossip.clone(),
            chain_id,
            scores: Arc::new(PeerScoreTable::new(config.score.clone())),
            limiter: RateLimiter::new(config.rate_limit.clone(), now),
            dedup,
            mesh: Mutex::new(Mesh::new(config.mesh.clone())),
            consensus,
            chain,
            sampler: None,
            sync_requests: None,
            metrics: None,
            last_heartbeat: Mutex::new(now),
            last_backpressure: Mutex::new(false),
            max_data_len,
        }
    }

    pub fn with_sampler(mut self, sampler: SamplingPool) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_sync_requests(mut self, tx: mpsc::Sender<SyncRequest>) -> Self {
        self.sync_requests = Some(tx);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<P2pMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // -----------------------------------------------------------------------
    // Inbound pipeline
    // -----------------------------------------------------------------------

    /// Run one inbound envelope through the pipeline.
    pub fn handle_gossip(&self, from: PeerId, env: &GossipEnvelope, now: Instant) -> GossipVerdict {
        let topic_hint = Topic::parse(&env.topic);
        match self.run_pipeline(from, env, now) {
            Ok((topic, id, object)) => self.accept(from, env, topic, id, object, now),
            Err(reason) => {
                let disconnect = self.reject(from, topic_hint, &reason, now);
                GossipVerdict::Dropped { reason, disconnect }
            }
        }
    }

    fn run_pipeline(
        &self,
        from: PeerId,
        env: &GossipEnvelope,
        now: Instant,
    ) -> Result<(Topic, Hash32, GossipObject), GossipReject> {
        if self.scores.standing(&from, now) == Standing::Banned {
            return Err(GossipReject::Banned);
        }

        // 1. size gate
        if env.data.len() > self.max_data_len {
            return Err(GossipReject::Oversize {
                len: env.data.len(),
                max: self.max_data_len,
            });
        }

        // 2. envelope sanity
        let topic = Topic::parse(&env.topic)
            .ok_or_else(|| GossipReject::UnknownTopic(env.topic.clone()))?;
        if env.data.len() > topic.max_data_len() {
            return Err(GossipReject::Oversize {
                len: env.data.len(),
                max: topic.max_data_len(),
            });
        }
        if env.schema != topic.schema() {
            return Err(GossipReject::UnsupportedSchema {
                topic,
                schema: env.schema,
            });
        }
        if digest8(&env.data) != env.checksum {
            return Err(GossipReject::ChecksumMismatch);
        }
        if !self.mesh.lock().is_subscribed(topic) {
            return Err(GossipReject::NotSubscribed(topic));
        }

        // 3. dedup
        let object = GossipObject::decode(topic, &env.data)?;
        let id = object.content_id(&env.data);
        if self.window(topic).lock().contains(&id) {
            return Err(GossipReject::Duplicate);
        }
        if let GossipObject::Header(_) = &object {
            if self.chain.is_canonical(&id) {
                return Err(GossipReject::Stale);
            }
        }

        // 4. cheap checks
        let ctx = CheckContext {
            cfg: &self.cfg,
            chain_id: self.chain_id,
            threshold: self.consensus.current_threshold(),
            policy_root: Some(self.consensus.policy_root()),
            now_unix: unix_now(),
        };
        if let Err(reason) = cheap_check(&object, &ctx) {
            if let (GossipReject::ThresholdShock { .. }, GossipObject::Header(header)) =
                (&reason, &object)
            {
                self.request_sync(SyncRequest::SuspectHeader {
                    peer: from,
                    header: header.clone(),
                });
            }
            return Err(reason);
        }

        // 5. admission
        match self.limiter.admit(from, topic, env.data.len(), now) {
            Admission::Admitted => {}
            Admission::PeerLimited { .. } => return Err(GossipReject::OverQuota),
            Admission::GlobalLimited { .. } => return Err(GossipReject::GlobalOverQuota),
        }

        // Only now does the id enter the window, so an invalid message cannot
        // shadow a valid one carrying the same id.
        if !self.window(topic).lock().check_and_insert(id, now) {
            return Err(GossipReject::Duplicate);
        }
        Ok((topic, id, object))
    }

    fn accept(
        &self,
        from: PeerId,
        env: &GossipEnvelope,
        topic: Topic,
        id: Hash32,
        object: GossipObject,
        now: Instant,
    ) -> GossipVerdict {
        let standing = self.scores.record(from, Some(topic), ScoreEvent::FirstDelivery, now);

        // 6. sampled heavy check, applied later as a score update
        if let Some(sampler) = &self.sampler {
            if sampler.should_sample(self.scores.score(&from)) {
                sampler.dispatch(from, topic, id, env.data.clone());
            }
        }

        if let GossipObject::Header(header) = &object {
            if !header.is_genesis() && !self.chain.contains(&header.parent) {
                self.request_sync(SyncRequest::MissingParent {
                    peer: from,
                    parent: header.parent,
                    height: header.height.saturating_sub(1),
                });
            }
        }

        let forward = if standing.forwards() {
            let scores = &self.scores;
            let score = |p: &PeerId| scores.score(p);
            let mut mesh = self.mesh.lock();
            let mut targets = mesh.targets(topic, Some(&from), now, &score);
            if standing == Standing::Greylisted {
                targets.truncate(mesh.params().d_low);
            }
            targets
        } else {
            Vec::new()
        };

        if let Some(m) = &self.metrics {
            m.gossip_accepted.with_label_values(&[topic.as_str()]).inc();
        }
        trace!(
            peer = %from.short(),
            topic = %topic,
            id = %id.short(),
            forward = forward.len(),
            "gossip accepted"
        );
        GossipVerdict::Accepted {
            topic,
            id,
            object,
            forward,
        }
    }

    /// Count the drop, charge the penalty. Returns whether to disconnect.
    fn reject(
        &self,
        from: PeerId,
        topic: Option<Topic>,
        reason: &GossipReject,
        now: Instant,
    ) -> bool {
        if let Some(m) = &self.metrics {
            let label = topic.map(Topic::as_str).unwrap_or("unknown");
            m.record_drop(Some(&from), reason.outcome(), label);
        }
        let mut disconnect = reason.severity().is_fatal();
        if let Some(event) = reason.penalty() {
            disconnect |= self.penalize(from, topic, event, now) == Standing::Banned;
        }
        if reason.is_hard() {
            debug!(
                peer = %from.short(),
                outcome = reason.outcome(),
                error = %reason,
                "gossip dropped"
            );
        } else {
            trace!(peer = %from.short(), outcome = reason.outcome(), "gossip soft drop");
        }
        disconnect
    }

    fn penalize(
        &self,
        peer: PeerId,
        topic: Option<Topic>,
        event: ScoreEvent,
        now: Instant,
    ) -> Standing {
        let offenses = self.scores.offenses(&peer);
        let standing = self.scores.record(peer, topic, event, now);
        if self.scores.offenses(&peer) > offenses {
            if let Some(m) = &self.metrics {
                m.bans.inc();
            }
        }
        standing
    }

    fn request_sync(&self, request: SyncRequest) {
        if let Some(tx) = &self.sync_requests {
            if let Err(e) = tx.try_send(request) {
                trace!(error = %e, "sync request channel full");
            }
        }
    }

    fn window(&self, topic: Topic) -> &Mutex<DedupWindow> {
        // Every topic gets a window at construction.
        &self.dedup[&topic]
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Wrap a locally produced payload and pick its targets. The payload
    /// enters the dedup window so echoes from peers are dropped.
    pub fn publish(
        &self,
        topic: Topic,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<Published, GossipReject> {
        if data.len() > topic.max_data_len() {
            return Err(GossipReject::Oversize {
                len: data.len(),
                max: topic.max_data_len(),
            });
        }
        let object = GossipObject::decode(topic, &data)?;
        let id = object.content_id(&data);
        if !self.window(topic).lock().check_and_insert(id, now) {
            return Err(GossipReject::Duplicate);
        }

        let scores = &self.scores;
        let score = |p: &PeerId| scores.score(p);
        let targets = self.mesh.lock().targets(topic, None, now, &score);
        debug!(topic = %topic, id = %id.short(), targets = targets.len(), "gossip published");
        Ok(Published {
            id,
            envelope: GossipEnvelope {
                topic: topic.as_str().to_string(),
                schema: topic.schema(),
                checksum: digest8(&data),
                data,
            },
            targets,
        })
    }

    pub fn subscribe(&self, topic: Topic, now: Instant) -> Vec<ControlCommand> {
        let scores = &self.scores;
        let score = |p: &PeerId| scores.score(p);
        let commands = self.mesh.lock().join(topic, now, &score);
        info!(topic = %topic, grafted = commands.len(), "subscribed");
        commands
    }

    pub fn unsubscribe(&self, topic: Topic, now: Instant) -> Vec<ControlCommand> {
        let commands = self.mesh.lock().leave(topic, now);
        info!(topic = %topic, pruned = commands.len(), "unsubscribed");
        commands
    }

    pub fn subscriptions(&self) -> Vec<Topic> {
        self.mesh.lock().subscriptions()
    }

    // -----------------------------------------------------------------------
    // Peers and control
    // -----------------------------------------------------------------------

    pub fn add_peer(&self, peer: PeerId, outbound: bool) {
        self.mesh.lock().add_peer(peer, outbound);
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.mesh.lock().remove_peer(peer);
    }

    /// Record a peer's `subscribe`. Unknown topic names are ignored.
    pub fn on_peer_subscribe(&self, peer: PeerId, list: &TopicList) {
        let mut mesh = self.mesh.lock();
        for topic in list.topics.iter().filter_map(|t| Topic::parse(t)) {
            mesh.peer_subscribed(peer, topic);
        }
    }

    pub fn on_peer_unsubscribe(&self, peer: &PeerId, list: &TopicList) {
        let mut mesh = self.mesh.lock();
        for topic in list.topics.iter().filter_map(|t| Topic::parse(t)) {
            mesh.peer_unsubscribed(peer, topic);
        }
    }

    /// Handle an inbound graft. Returns a prune to send back when refused.
    pub fn on_graft(&self, peer: PeerId, topic: &str, now: Instant) -> Option<ControlCommand> {
        let standing = self.scores.standing(&peer, now);
        if !standing.accepts_control() {
            debug!(peer = %peer.short(), standing = standing.as_str(), "graft ignored");
            return None;
        }
        let topic = Topic::parse(topic)?;
        let (outcome, backoff) = {
            let mut mesh = self.mesh.lock();
            (mesh.handle_graft(peer, topic, now), mesh.params().prune_backoff())
        };
        match outcome {
            GraftOutcome::Accepted | GraftOutcome::AlreadyMember => None,
            GraftOutcome::NotSubscribed | GraftOutcome::Full => {
                Some(ControlCommand::Prune { peer, topic, backoff })
            }
            GraftOutcome::Backoff => {
                self.penalize(peer, Some(topic), ScoreEvent::GraftDuringBackoff, now);
                Some(ControlCommand::Prune { peer, topic, backoff })
            }
        }
    }

    pub fn on_prune(&self, peer: PeerId, prune: &Prune, now: Instant) {
        let standing = self.scores.standing(&peer, now);
        if !standing.accepts_control() {
            debug!(peer = %peer.short(), standing = standing.as_str(), "prune ignored");
            return;
        }
        if let Some(topic) = Topic::parse(&prune.topic) {
            self.mesh.lock().handle_prune(
                &peer,
                topic,
                Duration::from_secs(prune.backoff_secs),
                now,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------------

    pub fn heartbeat(&self, now: Instant) -> HeartbeatOutput {
        let elapsed = {
            let mut last = self.last_heartbeat.lock();
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };

        let memberships = self.mesh.lock().memberships();
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            for (topic, peer) in memberships {
                self.scores.record(peer, Some(topic), ScoreEvent::MeshTime(secs), now);
            }
        }
        let forgotten = self.scores.tick(now);

        for (topic, window) in &self.dedup {
            if window.lock().maybe_rotate(now) {
                trace!(topic = %topic, "dedup window rotated");
            }
        }
        self.limiter.refresh_pressure(now);
        self.limiter.prune_idle(now);

        let scores = &self.scores;
        let score = |p: &PeerId| scores.score(p);
        let (control, disconnect) = {
            let mut mesh = self.mesh.lock();
            let control = mesh.heartbeat(now, &score);
            let disconnect: Vec<PeerId> = mesh
                .peers()
                .into_iter()
                .filter(|p| scores.standing(p, now) == Standing::Banned)
                .collect();
            if let Some(m) = &self.metrics {
                for topic in Topic::ALL {
                    m.mesh_peers
                        .with_label_values(&[topic.as_str()])
                        .set(mesh.mesh_peers(topic).len() as i64);
                }
            }
            (control, disconnect)
        };

        let backpressure = self.limiter.backpressure(now);
        let changed = {
            let mut last = self.last_backpressure.lock();
            let changed = *last != backpressure;
            *last = backpressure;
            changed
        };
        if changed {
            if backpressure {
                warn!("gossip backpressure on");
            } else {
                info!("gossip backpressure off");
            }
            self.request_sync(SyncRequest::Backpressure(backpressure));
        }

        trace!(
            control = control.len(),
            disconnect = disconnect.len(),
            forgotten,
            "gossip heartbeat"
        );
        HeartbeatOutput {
            control,
            disconnect,
            backpressure,
        }
    }

    /// Apply finished heavy checks. Returns peers that are now banned.
    pub fn apply_sample_results(
        &self,
        results: impl IntoIterator<Item = SampleResult>,
        now: Instant,
    ) -> Vec<PeerId> {
        let mut banned = Vec::new();
        for r in results {
            let event = if r.passed {
                ScoreEvent::SamplePass
            } else {
                if let Some(m) = &self.metrics {
                    m.record_drop(Some(&r.peer), "sample_fail", r.topic.as_str());
                }
                debug!(
                    peer = %r.peer.short(),
                    topic = %r.topic,
                    id = %r.id.short(),
                    "heavy check failed"
                );
                ScoreEvent::SampleFail
            };
            if self.penalize(r.peer, Some(r.topic), event, now) == Standing::Banned
                && !banned.contains(&r.peer)
            {
                banned.push(r.peer);
            }
        }
        banned
    }

    /// Charge a peer for an oversize frame caught below the gossip layer.
    pub fn record_oversize(&self, peer: PeerId, now: Instant) -> Standing {
        if let Some(m) = &self.metrics {
            m.record_drop(Some(&peer), "oversize", "frame");
        }
        self.penalize(peer, None, ScoreEvent::Oversize, now)
    }

    /// Charge or credit a peer for something sync observed.
    pub fn record_event(&self, peer: PeerId, event: ScoreEvent, now: Instant) -> Standing {
        self.penalize(peer, None, event, now)
    }

    /// Forget ids so the content is fresh again, e.g. after a reorg.
    pub fn invalidate(&self, topic: Topic, ids: &[Hash32]) -> usize {
        let removed = self.window(topic).lock().invalidate(ids);
        if removed > 0 {
            debug!(topic = %topic, removed, "dedup ids invalidated");
        }
        removed
    }

    pub fn peer_standing(&self, peer: &PeerId, now: Instant) -> Standing {
        self.scores.standing(peer, now)
    }

    pub fn backpressure(&self, now: Instant) -> bool {
        self.limiter.backpressure(now)
    }

    pub fn scores(&self) -> Arc<PeerScoreTable> {
        Arc::clone(&self.scores)
    }

    pub fn mesh_peers(&self, topic: Topic) -> Vec<PeerId> {
        self.mesh.lock().mesh_peers(topic)
    }
}
