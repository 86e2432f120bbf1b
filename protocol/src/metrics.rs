//! # Transport Metrics
//!
//! Prometheus handles for every layer of the stack. The node owns the
//! registry (prefixed `tessera`) and passes it in, so the names below
//! surface as `tessera_p2p_*`.
//!
//! Every drop increments both `p2p_drops_total{outcome,topic}` and
//! `p2p_peer_drops_total{peer,outcome}`. The peer label is the short id, which
//! keeps cardinality bounded by the connected set.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::types::PeerId;

#[derive(Clone)]
pub struct P2pMetrics {
    pub drops: IntCounterVec,
    pub peer_drops: IntCounterVec,
    pub gossip_accepted: IntCounterVec,
    pub handshakes: IntCounterVec,
    pub handshake_seconds: Histogram,
    pub connected_peers: IntGauge,
    pub frames_in: IntCounter,
    pub frames_out: IntCounter,
    pub bytes_in: IntCounter,
    pub bytes_out: IntCounter,
    pub rekeys: IntCounter,
    pub bans: IntCounter,
    pub mesh_peers: IntGaugeVec,
    pub headers_accepted: IntCounter,
    pub bodies_imported: IntCounter,
    pub fetch_timeouts: IntCounter,
    pub orphans: IntGauge,
    pub reorgs: IntCounter,
    pub safe_mode: IntGauge,
    pub head_height: IntGauge,
}

impl P2pMetrics {
    /// Create every metric and register it with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let drops = IntCounterVec::new(
            Opts::new("p2p_drops_total", "Dropped messages by outcome and topic"),
            &["outcome", "topic"],
        )?;
        let peer_drops = IntCounterVec::new(
            Opts::new("p2p_peer_drops_total", "Dropped messages by sending peer"),
            &["peer", "outcome"],
        )?;
        let gossip_accepted = IntCounterVec::new(
            Opts::new("p2p_gossip_accepted_total", "Gossip messages accepted and forwarded"),
            &["topic"],
        )?;
        let handshakes = IntCounterVec::new(
            Opts::new("p2p_handshakes_total", "Handshake attempts by result"),
            &["result"],
        )?;
        let handshake_seconds = Histogram::with_opts(
            HistogramOpts::new("p2p_handshake_seconds", "Handshake duration")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let connected_peers = IntGauge::new("p2p_connected_peers", "Peers with a live session")?;
        let frames_in = IntCounter::new("p2p_frames_in_total", "Frames received")?;
        let frames_out = IntCounter::new("p2p_frames_out_total", "Frames sent")?;
        let bytes_in = IntCounter::new("p2p_bytes_in_total", "Frame bytes received")?;
        let bytes_out = IntCounter::new("p2p_bytes_out_total", "Frame bytes sent")?;
        let rekeys = IntCounter::new("p2p_rekeys_total", "Send-side key ratchets")?;
        let bans = IntCounter::new("p2p_bans_total", "Peers banned by score")?;
        let mesh_peers = IntGaugeVec::new(
            Opts::new("p2p_mesh_peers", "Mesh degree per topic"),
            &["topic"],
        )?;
        let headers_accepted =
            IntCounter::new("sync_headers_accepted_total", "Headers attached to the frontier")?;
        let bodies_imported =
            IntCounter::new("sync_bodies_imported_total", "Bodies passed to import")?;
        let fetch_timeouts =
            IntCounter::new("sync_fetch_timeouts_total", "Body fetch batches that timed out")?;
        let orphans = IntGauge::new("sync_orphans", "Entries in the orphan pool")?;
        let reorgs = IntCounter::new("sync_reorgs_total", "Best-chain switches")?;
        let safe_mode = IntGauge::new("sync_safe_mode", "1 while body import is paused")?;
        let head_height = IntGauge::new("sync_head_height", "Height of the best header")?;

        registry.register(Box::new(drops.clone()))?;
        registry.register(Box::new(peer_drops.clone()))?;
        registry.register(Box::new(gossip_accepted.clone()))?;
        registry.register(Box::new(handshakes.clone()))?;
        registry.register(Box::new(handshake_seconds.clone()))?;
        registry.register(Box::new(connected_peers.clone()))?;
        registry.register(Box::new(frames_in.clone()))?;
        registry.register(Box::new(frames_out.clone()))?;
        registry.register(Box::new(bytes_in.clone()))?;
        registry.register(Box::new(bytes_out.clone()))?;
        registry.register(Box::new(rekeys.clone()))?;
        registry.register(Box::new(bans.clone()))?;
        registry.register(Box::new(mesh_peers.clone()))?;
        registry.register(Box::new(headers_accepted.clone()))?;
        registry.register(Box::new(bodies_imported.clone()))?;
        registry.register(Box::new(fetch_timeouts.clone()))?;
        registry.register(Box::new(orphans.clone()))?;
        registry.register(Box::new(reorgs.clone()))?;
        registry.register(Box::new(safe_mode.clone()))?;
        registry.register(Box::new(head_height.clone()))?;

        Ok(Self {
            drops,
            peer_drops,
            gossip_accepted,
            handshakes,
            handshake_seconds,
            connected_peers,
            frames_in,
            frames_out,
            bytes_in,
            bytes_out,
            rekeys,
            bans,
            mesh_peers,
            headers_accepted,
            bodies_imported,
            fetch_timeouts,
            orphans,
            reorgs,
            safe_mode,
            head_height,
        })
    }

    /// Count a drop against both the outcome/topic and the sending peer.
    pub fn record_drop(&self, peer: Option<&PeerId>, outcome: &str, topic: &str) {
        self.drops.with_label_values(&[outcome, topic]).inc();
        if let Some(peer) = peer {
            self.peer_drops
                .with_label_values(&[&peer.short(), outcome])
                .inc();
        }
    }

    pub fn record_handshake(&self, result: &str, seconds: f64) {
        self.handshakes.with_label_values(&[result]).inc();
        self.handshake_seconds.observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_are_labelled_by_outcome_topic_and_peer() {
        let registry = Registry::new_custom(Some("tessera".into()), None).unwrap();
        let m = P2pMetrics::new(&registry).unwrap();
        let peer = PeerId([0xAB; 32]);
        m.record_drop(Some(&peer), "oversize", "headers");
        m.record_drop(None, "duplicate", "tx");

        assert_eq!(m.drops.with_label_values(&["oversize", "headers"]).get(), 1);
        assert_eq!(m.peer_drops.with_label_values(&["abababab", "oversize"]).get(), 1);
        let names: Vec<String> = registry.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"tessera_p2p_drops_total".to_string()));
    }

    #[test]
    fn double_registration_is_an_error() {
        let registry = Registry::new();
        assert!(P2pMetrics::new(&registry).is_ok());
        assert!(P2pMetrics::new(&registry).is_err());
    }
}
