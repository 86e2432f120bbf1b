//! # Topic Mesh
//!
//! Per-topic overlay in the GossipSub mould. For every topic we subscribe to
//! we keep a mesh of `d` peers (held within `[d_low, d_high]` by the
//! heartbeat) that receive every message in full. For topics we publish to
//! without subscribing we keep a fanout set instead, which expires after
//! `fanout_ttl` of disuse.
//!
//! Pruned peers sit out a backoff before they may be grafted again, whether
//! we pruned them or they pruned us. The mesh does no I/O; it returns
//! [`ControlCommand`]s for the engine to send.
//!
//! Peer scores are supplied by the caller as a lookup function so this
//! module stays independent of the score table.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{
    FANOUT_TTL, MESH_D, MESH_D_HIGH, MESH_D_LOW, MESH_D_OUT, MESH_HEARTBEAT,
    OPPORTUNISTIC_GRAFT_TICKS, PRUNE_BACKOFF,
};
use crate::gossip::Topic;
use crate::types::PeerId;
use crate::wire::messages::{Graft, Message, Prune};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshParams {
    /// Target degree.
    pub d: usize,
    pub d_low: usize,
    pub d_high: usize,
    /// Outbound connections the heartbeat keeps in each mesh when it can.
    pub d_out: usize,
    pub heartbeat_ms: u64,
    pub prune_backoff_ms: u64,
    /// Ceiling on a backoff requested by a remote prune.
    pub max_prune_backoff_ms: u64,
    pub fanout_ttl_ms: u64,
    /// Heartbeats between opportunistic graft rounds.
    pub opportunistic_graft_ticks: u64,
    /// Opportunistic grafting kicks in when the mesh median score is at or
    /// below this.
    pub opportunistic_graft_threshold: f64,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            d: MESH_D,
            d_low: MESH_D_LOW,
            d_high: MESH_D_HIGH,
            d_out: MESH_D_OUT,
            heartbeat_ms: MESH_HEARTBEAT.as_millis() as u64,
            prune_backoff_ms: PRUNE_BACKOFF.as_millis() as u64,
            max_prune_backoff_ms: 10 * PRUNE_BACKOFF.as_millis() as u64,
            fanout_ttl_ms: FANOUT_TTL.as_millis() as u64,
            opportunistic_graft_ticks: OPPORTUNISTIC_GRAFT_TICKS,
            opportunistic_graft_threshold: 0.0,
        }
    }
}

impl MeshParams {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn prune_backoff(&self) -> Duration {
        Duration::from_millis(self.prune_backoff_ms)
    }

    pub fn fanout_ttl(&self) -> Duration {
        Duration::from_millis(self.fanout_ttl_ms)
    }
}

/// A graft or prune the engine should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Graft { peer: PeerId, topic: Topic },
    Prune { peer: PeerId, topic: Topic, backoff: Duration },
}

impl ControlCommand {
    pub fn peer(&self) -> PeerId {
        match self {
            Self::Graft { peer, .. } | Self::Prune { peer, .. } => *peer,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Self::Graft { topic, .. } | Self::Prune { topic, .. } => *topic,
        }
    }

    pub fn to_message(&self) -> Message {
        match self {
            Self::Graft { topic, .. } => Message::Graft(Graft {
                topic: topic.as_str().to_string(),
            }),
            Self::Prune { topic, backoff, .. } => Message::Prune(Prune {
                topic: topic.as_str().to_string(),
                backoff_secs: backoff.as_secs(),
            }),
        }
    }
}

/// How an inbound graft was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraftOutcome {
    Accepted,
    /// Already a member; nothing changed.
    AlreadyMember,
    /// We do not carry this topic.
    NotSubscribed,
    /// The peer is still serving a prune backoff.
    Backoff,
    /// The mesh is at `d_high`.
    Full,
}

#[derive(Debug, Default)]
struct PeerEntry {
    topics: HashSet<Topic>,
    outbound: bool,
}

#[derive(Debug, Default)]
struct TopicState {
    mesh: HashSet<PeerId>,
    fanout: HashSet<PeerId>,
    fanout_expires: Option<Instant>,
    backoff: HashMap<PeerId, Instant>,
}

impl TopicState {
    fn in_backoff(&self, peer: &PeerId, now: Instant) -> bool {
        self.backoff.get(peer).is_some_and(|until| *until > now)
    }
}

pub struct Mesh {
    params: MeshParams,
    subscribed: HashSet<Topic>,
    peers: HashMap<PeerId, PeerEntry>,
    topics: HashMap<Topic, TopicState>,
    ticks: u64,
}

impl Mesh {
    pub fn new(params: MeshParams) -> Self {
        Self {
            params,
            subscribed: HashSet::new(),
            peers: HashMap::new(),
            topics: HashMap::new(),
            ticks: 0,
        }
    }

    pub fn params(&self) -> &MeshParams {
        &self.params
    }

    // -- peers --------------------------------------------------------------

    pub fn add_peer(&mut self, peer: PeerId, outbound: bool) {
        self.peers.entry(peer).or_default().outbound = outbound;
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        for state in self.topics.values_mut() {
            state.mesh.remove(peer);
            state.fanout.remove(peer);
        }
    }

    pub fn peer_subscribed(&mut self, peer: PeerId, topic: Topic) {
        self.peers.entry(peer).or_default().topics.insert(topic);
    }

    pub fn peer_unsubscribed(&mut self, peer: &PeerId, topic: Topic) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.topics.remove(&topic);
        }
        if let Some(state) = self.topics.get_mut(&topic) {
            state.mesh.remove(peer);
            state.fanout.remove(peer);
        }
    }

    fn subscribers(&self, topic: Topic) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, e)| e.topics.contains(&topic))
            .map(|(p, _)| *p)
            .collect()
    }

    // -- local subscription -------------------------------------------------

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.subscribed.contains(&topic)
    }

    pub fn subscriptions(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.subscribed.iter().copied().collect();
        topics.sort();
        topics
    }

    /// Subscribe locally and graft up to `d` peers, seeding from the fanout.
    pub fn join(
        &mut self,
        topic: Topic,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<ControlCommand> {
        if !self.subscribed.insert(topic) {
            return Vec::new();
        }
        let state = self.topics.entry(topic).or_default();
        let seed: Vec<PeerId> = state.fanout.drain().collect();
        state.fanout_expires = None;
        let mut commands = Vec::new();
        for peer in seed.into_iter().take(self.params.d) {
            if score(&peer) >= 0.0 {
                state.mesh.insert(peer);
                commands.push(ControlCommand::Graft { peer, topic });
            }
        }
        commands.extend(self.fill(topic, now, score, "join"));
        commands
    }

    /// Unsubscribe locally and prune the whole mesh.
    pub fn leave(&mut self, topic: Topic, now: Instant) -> Vec<ControlCommand> {
        if !self.subscribed.remove(&topic) {
            return Vec::new();
        }
        let backoff = self.params.prune_backoff();
        let Some(state) = self.topics.get_mut(&topic) else {
            return Vec::new();
        };
        let mut commands = Vec::new();
        for peer in state.mesh.drain() {
            state.backoff.insert(peer, now + backoff);
            commands.push(ControlCommand::Prune {
                peer,
                topic,
                backoff,
            });
        }
        commands
    }

    // -- remote control -----------------------------------------------------

    pub fn handle_graft(&mut self, peer: PeerId, topic: Topic, now: Instant) -> GraftOutcome {
        if !self.subscribed.contains(&topic) {
            return GraftOutcome::NotSubscribed;
        }
        let d_high = self.params.d_high;
        let state = self.topics.entry(topic).or_default();
        if state.mesh.contains(&peer) {
            return GraftOutcome::AlreadyMember;
        }
        if state.in_backoff(&peer, now) {
            return GraftOutcome::Backoff;
        }
        if state.mesh.len() >= d_high {
            return GraftOutcome::Full;
        }
        state.mesh.insert(peer);
        self.peers.entry(peer).or_default().topics.insert(topic);
        GraftOutcome::Accepted
    }

    pub fn handle_prune(&mut self, peer: &PeerId, topic: Topic, backoff: Duration, now: Instant) {
        let ceiling = Duration::from_millis(self.params.max_prune_backoff_ms);
        let backoff = backoff.max(self.params.prune_backoff()).min(ceiling);
        let state = self.topics.entry(topic).or_default();
        state.mesh.remove(peer);
        state.backoff.insert(*peer, now + backoff);
    }

    // -- forwarding ---------------------------------------------------------

    /// Peers that should receive a message on `topic`, excluding its sender.
    ///
    /// Uses the mesh when subscribed; otherwise the fanout set, refreshed
    /// from the best-scoring subscribers whenever it has expired.
    pub fn targets(
        &mut self,
        topic: Topic,
        exclude: Option<&PeerId>,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<PeerId> {
        let subscribed = self.subscribed.contains(&topic);
        if !subscribed {
            let expired = self
                .topics
                .get(&topic)
                .map(|s| s.fanout.is_empty() || s.fanout_expires.map_or(true, |t| t <= now))
                .unwrap_or(true);
            if expired {
                let candidates: Vec<PeerId> = self
                    .subscribers(topic)
                    .into_iter()
                    .filter(|p| score(p) >= 0.0)
                    .collect();
                let chosen = pick_best(candidates, self.params.d, score);
                let state = self.topics.entry(topic).or_default();
                state.fanout = chosen.into_iter().collect();
            }
            let ttl = self.params.fanout_ttl();
            let state = self.topics.entry(topic).or_default();
            state.fanout_expires = Some(now + ttl);
        }
        let Some(state) = self.topics.get(&topic) else {
            return Vec::new();
        };
        let set = if subscribed { &state.mesh } else { &state.fanout };
        let mut out: Vec<PeerId> = set
            .iter()
            .filter(|p| Some(*p) != exclude)
            .copied()
            .collect();
        out.sort();
        out
    }

    // -- heartbeat ----------------------------------------------------------

    /// Keep every mesh within bounds and expire stale fanout and backoff.
    pub fn heartbeat(
        &mut self,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<ControlCommand> {
        self.ticks += 1;
        let backoff = self.params.prune_backoff();
        let mut commands = Vec::new();

        let topics: Vec<Topic> = self.topics.keys().copied().collect();
        for topic in topics {
            let subscribed = self.subscribed.contains(&topic);
            let Some(state) = self.topics.get_mut(&topic) else {
                continue;
            };
            state.backoff.retain(|_, until| *until > now);
            if state.fanout_expires.is_some_and(|t| t <= now) {
                state.fanout.clear();
                state.fanout_expires = None;
            }
            if !subscribed {
                continue;
            }

            // Negative scorers leave first.
            let negative: Vec<PeerId> =
                state.mesh.iter().filter(|p| score(p) < 0.0).copied().collect();
            for peer in negative {
                state.mesh.remove(&peer);
                state.backoff.insert(peer, now + backoff);
                commands.push(ControlCommand::Prune { peer, topic, backoff });
            }

            let len = state.mesh.len();
            if len < self.params.d_low {
                commands.extend(self.fill(topic, now, score, "under d_low"));
            } else if len > self.params.d_high {
                commands.extend(self.trim(topic, now, score));
            }
            commands.extend(self.keep_outbound(topic, now, score));

            if self.params.opportunistic_graft_ticks > 0
                && self.ticks % self.params.opportunistic_graft_ticks == 0
            {
                commands.extend(self.opportunistic(topic, now, score));
            }
        }
        commands
    }

    fn candidates(
        &self,
        topic: Topic,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<PeerId> {
        let state = self.topics.get(&topic);
        self.subscribers(topic)
            .into_iter()
            .filter(|p| {
                state.map_or(true, |s| !s.mesh.contains(p) && !s.in_backoff(p, now))
                    && score(p) >= 0.0
            })
            .collect()
    }

    fn fill(
        &mut self,
        topic: Topic,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
        reason: &'static str,
    ) -> Vec<ControlCommand> {
        let have = self.topics.get(&topic).map_or(0, |s| s.mesh.len());
        let need = self.params.d.saturating_sub(have);
        if need == 0 {
            return Vec::new();
        }
        let chosen = pick_best(self.candidates(topic, now, score), need, score);
        self.graft_all(topic, chosen, reason)
    }

    fn trim(
        &mut self,
        topic: Topic,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<ControlCommand> {
        let backoff = self.params.prune_backoff();
        let d = self.params.d;
        let Some(state) = self.topics.get_mut(&topic) else {
            return Vec::new();
        };
        let mut members: Vec<PeerId> = state.mesh.iter().copied().collect();
        // Lowest score first, then highest id, so the survivors match pick_best.
        members.sort_by(|a, b| score(a).total_cmp(&score(b)).then_with(|| b.cmp(a)));
        let excess = members.len().saturating_sub(d);
        let mut commands = Vec::with_capacity(excess);
        for peer in members.into_iter().take(excess) {
            state.mesh.remove(&peer);
            state.backoff.insert(peer, now + backoff);
            commands.push(ControlCommand::Prune { peer, topic, backoff });
        }
        trace!(topic = %topic, pruned = commands.len(), "mesh over d_high");
        commands
    }

    fn keep_outbound(
        &mut self,
        topic: Topic,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<ControlCommand> {
        let Some(state) = self.topics.get(&topic) else {
            return Vec::new();
        };
        let outbound = state
            .mesh
            .iter()
            .filter(|p| self.peers.get(*p).is_some_and(|e| e.outbound))
            .count();
        let need = self.params.d_out.saturating_sub(outbound);
        if need == 0 || state.mesh.len() >= self.params.d_high {
            return Vec::new();
        }
        let candidates: Vec<PeerId> = self
            .candidates(topic, now, score)
            .into_iter()
            .filter(|p| self.peers.get(p).is_some_and(|e| e.outbound))
            .collect();
        let chosen = pick_best(candidates, need, score);
        self.graft_all(topic, chosen, "outbound quota")
    }

    fn opportunistic(
        &mut self,
        topic: Topic,
        now: Instant,
        score: &dyn Fn(&PeerId) -> f64,
    ) -> Vec<ControlCommand> {
        let Some(state) = self.topics.get(&topic) else {
            return Vec::new();
        };
        if state.mesh.is_empty() {
            return Vec::new();
        }
        let mut scores: Vec<f64> = state.mesh.iter().map(|p| score(p)).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        let median = scores[scores.len() / 2];
        if median > self.params.opportunistic_graft_threshold {
            return Vec::new();
        }
        let better: Vec<PeerId> = self
            .candidates(topic, now, score)
            .into_iter()
            .filter(|p| score(p) > median)
            .collect();
        let chosen = pick_best(better, self.params.d_out, score);
        self.graft_all(topic, chosen, "opportunistic")
    }

    fn graft_all(
        &mut self,
        topic: Topic,
        peers: Vec<PeerId>,
        reason: &'static str,
    ) -> Vec<ControlCommand> {
        let state = self.topics.entry(topic).or_default();
        let mut commands = Vec::with_capacity(peers.len());
        for peer in peers {
            if state.mesh.insert(peer) {
                commands.push(ControlCommand::Graft { peer, topic });
            }
        }
        if !commands.is_empty() {
            trace!(topic = %topic, grafted = commands.len(), reason, "mesh graft");
        }
        commands
    }

    // -- queries ------------------------------------------------------------

    pub fn mesh_peers(&self, topic: Topic) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .topics
            .get(&topic)
            .map(|s| s.mesh.iter().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Every connected peer the mesh knows about.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn in_mesh(&self, topic: Topic, peer: &PeerId) -> bool {
        self.topics.get(&topic).is_some_and(|s| s.mesh.contains(peer))
    }

    pub fn in_backoff(&self, topic: Topic, peer: &PeerId, now: Instant) -> bool {
        self.topics.get(&topic).is_some_and(|s| s.in_backoff(peer, now))
    }

    /// Every `(topic, peer)` mesh membership, for mesh-time accounting.
    pub fn memberships(&self) -> Vec<(Topic, PeerId)> {
        self.topics
            .iter()
            .flat_map(|(t, s)| s.mesh.iter().map(move |p| (*t, *p)))
            .collect()
    }
}

/// Best `k` by score, highest first. Equal scores are shuffled so that
/// nodes with identical views do not all pick the same peers.
fn pick_best(mut candidates: Vec<PeerId>, k: usize, score: &dyn Fn(&PeerId) -> f64) -> Vec<PeerId> {
    candidates.shuffle(&mut rand::thread_rng());
    candidates.sort_by(|a, b| score(b).total_cmp(&score(a)));
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn neutral(_: &PeerId) -> f64 {
        0.0
    }

    fn mesh_with(n: u8, topic: Topic) -> Mesh {
        let mut mesh = Mesh::new(MeshParams::default());
        for i in 1..=n {
            mesh.add_peer(peer(i), i % 2 == 0);
            mesh.peer_subscribed(peer(i), topic);
        }
        mesh
    }

    #[test]
    fn join_grafts_up_to_d() {
        let now = Instant::now();
        let mut mesh = mesh_with(10, Topic::Headers);
        let cmds = mesh.join(Topic::Headers, now, &neutral);
        assert_eq!(cmds.len(), 6);
        assert!(cmds.iter().all(|c| matches!(c, ControlCommand::Graft { .. })));
        assert_eq!(mesh.mesh_peers(Topic::Headers).len(), 6);
        assert!(mesh.join(Topic::Headers, now, &neutral).is_empty());
    }

    #[test]
    fn heartbeat_restores_bounds() {
        let now = Instant::now();
        let mut mesh = mesh_with(20, Topic::Tx);
        mesh.join(Topic::Tx, now, &neutral);
        for i in 1..=20 {
            mesh.handle_graft(peer(i), Topic::Tx, now);
        }
        assert_eq!(mesh.mesh_peers(Topic::Tx).len(), 12);
        mesh.heartbeat(now, &neutral);
        let len = mesh.mesh_peers(Topic::Tx).len();
        assert!((4..=12).contains(&len), "degree {len}");

        // Drop most members; the heartbeat grafts back up to d.
        for p in mesh.mesh_peers(Topic::Tx).into_iter().take(len - 2) {
            mesh.remove_peer(&p);
        }
        mesh.heartbeat(now, &neutral);
        assert!(mesh.mesh_peers(Topic::Tx).len() >= 4);
    }

    #[test]
    fn negative_scorers_are_pruned_with_backoff() {
        let now = Instant::now();
        let mut mesh = mesh_with(8, Topic::Tx);
        mesh.join(Topic::Tx, now, &neutral);
        let victim = mesh.mesh_peers(Topic::Tx)[0];
        let score = move |p: &PeerId| if *p == victim { -5.0 } else { 0.0 };
        let cmds = mesh.heartbeat(now, &score);
        assert!(cmds.contains(&ControlCommand::Prune {
            peer: victim,
            topic: Topic::Tx,
            backoff: Duration::from_secs(60),
        }));
        assert!(!mesh.in_mesh(Topic::Tx, &victim));
        assert!(mesh.in_backoff(Topic::Tx, &victim, now));
        assert_eq!(mesh.handle_graft(victim, Topic::Tx, now), GraftOutcome::Backoff);
    }

    #[test]
    fn graft_refused_when_not_subscribed_or_full() {
        let now = Instant::now();
        let mut mesh = mesh_with(14, Topic::Shares);
        assert_eq!(
            mesh.handle_graft(peer(1), Topic::Shares, now),
            GraftOutcome::NotSubscribed
        );
        mesh.join(Topic::Shares, now, &neutral);
        for i in 1..=14 {
            mesh.handle_graft(peer(i), Topic::Shares, now);
        }
        assert_eq!(mesh.mesh_peers(Topic::Shares).len(), 12);
        let outsider = (1..=14)
            .map(peer)
            .find(|p| !mesh.in_mesh(Topic::Shares, p))
            .unwrap();
        assert_eq!(mesh.handle_graft(outsider, Topic::Shares, now), GraftOutcome::Full);
    }

    #[test]
    fn remote_prune_enforces_minimum_backoff() {
        let now = Instant::now();
        let mut mesh = mesh_with(6, Topic::Headers);
        mesh.join(Topic::Headers, now, &neutral);
        mesh.handle_prune(&peer(1), Topic::Headers, Duration::from_secs(1), now);
        assert!(!mesh.in_mesh(Topic::Headers, &peer(1)));
        assert!(mesh.in_backoff(Topic::Headers, &peer(1), now + Duration::from_secs(30)));
        assert!(!mesh.in_backoff(Topic::Headers, &peer(1), now + Duration::from_secs(61)));
    }

    #[test]
    fn fanout_used_without_subscription_and_expires() {
        let now = Instant::now();
        let mut mesh = mesh_with(10, Topic::Blobs);
        let targets = mesh.targets(Topic::Blobs, None, now, &neutral);
        assert_eq!(targets.len(), 6);
        // Sticky within the ttl.
        assert_eq!(mesh.targets(Topic::Blobs, None, now, &neutral), targets);
        mesh.heartbeat(now + Duration::from_secs(61), &neutral);
        assert!(mesh.topics[&Topic::Blobs].fanout.is_empty());
        assert!(mesh.mesh_peers(Topic::Blobs).is_empty());
    }

    #[test]
    fn targets_exclude_sender() {
        let now = Instant::now();
        let mut mesh = mesh_with(6, Topic::Headers);
        mesh.join(Topic::Headers, now, &neutral);
        let targets = mesh.targets(Topic::Headers, Some(&peer(1)), now, &neutral);
        assert_eq!(targets.len(), 5);
        assert!(!targets.contains(&peer(1)));
    }

    #[test]
    fn leave_prunes_everyone() {
        let now = Instant::now();
        let mut mesh = mesh_with(6, Topic::Tx);
        mesh.join(Topic::Tx, now, &neutral);
        let cmds = mesh.leave(Topic::Tx, now);
        assert_eq!(cmds.len(), 6);
        assert!(mesh.mesh_peers(Topic::Tx).is_empty());
        assert!(!mesh.is_subscribed(Topic::Tx));
    }

    #[test]
    fn opportunistic_graft_prefers_better_peers() {
        let now = Instant::now();
        let params = MeshParams {
            opportunistic_graft_ticks: 1,
            ..MeshParams::default()
        };
        let mut mesh = Mesh::new(params);
        for i in 1..=10 {
            mesh.add_peer(peer(i), false);
            mesh.peer_subscribed(peer(i), Topic::Tx);
        }
        // Only the first six are known when joining.
        let low = |_: &PeerId| 0.0;
        mesh.join(Topic::Tx, now, &low);
        let members = mesh.mesh_peers(Topic::Tx);
        let outsider = (1..=10).map(peer).find(|p| !members.contains(p)).unwrap();
        let score = move |p: &PeerId| if *p == outsider { 10.0 } else { 0.0 };
        let cmds = mesh.heartbeat(now, &score);
        assert!(cmds.contains(&ControlCommand::Graft {
            peer: outsider,
            topic: Topic::Tx,
        }));
    }

    #[test]
    fn control_commands_encode_as_messages() {
        let cmd = ControlCommand::Prune {
            peer: peer(1),
            topic: Topic::Tx,
            backoff: Duration::from_secs(60),
        };
        match cmd.to_message() {
            Message::Prune(p) => {
                assert_eq!(p.topic, "tx");
                assert_eq!(p.backoff_secs, 60);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
