//! # Prometheus Metrics
//!
//! One [`Registry`] with the `tessera` prefix holds the protocol's
//! [`P2pMetrics`] plus a couple of node-level series. Scraped at `/metrics`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use tessera_p2p::metrics::P2pMetrics;

pub struct NodeMetrics {
    registry: Registry,
    started: Instant,
    /// Protocol handles, shared with the service.
    pub p2p: Arc<P2pMetrics>,
    pub uptime_seconds: IntGauge,
    /// HTTP requests served, by route.
    pub api_requests: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tessera".into()), None)?;
        let p2p = Arc::new(P2pMetrics::new(&registry)?);

        let uptime_seconds =
            IntGauge::new("node_uptime_seconds", "Seconds since the node started")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let api_requests = IntCounterVec::new(
            Opts::new("node_api_requests_total", "HTTP API requests by route"),
            &["route"],
        )?;
        registry.register(Box::new(api_requests.clone()))?;

        Ok(Self {
            registry,
            started: Instant::now(),
            p2p,
            uptime_seconds,
            api_requests,
        })
    }

    /// Render every registered family in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        self.uptime_seconds.set(self.started.elapsed().as_secs() as i64);
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `/metrics` handler. 500 if encoding fails.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    metrics.api_requests.with_label_values(&["metrics"]).inc();
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_carry_the_prefix() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.p2p.head_height.set(7);
        let text = metrics.encode().unwrap();
        assert!(text.contains("tessera_sync_head_height 7"), "{text}");
        assert!(text.contains("tessera_node_uptime_seconds"));
    }
}
