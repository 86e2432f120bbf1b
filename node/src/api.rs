//! # HTTP API
//!
//! Operator-facing endpoints. All handlers share [`AppState`] through
//! axum's `State` extractor.
//!
//! | Method | Path              | Description                              |
//! |--------|-------------------|------------------------------------------|
//! | GET    | `/health`         | Liveness check                           |
//! | GET    | `/status`         | Head, peers, safe-mode and subscriptions |
//! | GET    | `/metrics`        | Prometheus text exposition               |
//! | POST   | `/safe-mode/exit` | Resume sync after a deep reorg           |

use axum::{
    extract::{FromRef, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tessera_p2p::net::NetError;
use tessera_p2p::{ServiceHandle, ServiceStatus};

use crate::metrics::{self, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    /// "mainnet", "testnet" or "devnet".
    pub network: String,
    pub service: ServiceHandle,
    pub metrics: SharedMetrics,
}

impl FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub p2p: ServiceStatus,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, err: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// 503 when the service loop is gone, 409 for anything the service refused.
fn service_error(e: NetError) -> Response {
    match e {
        NetError::ServiceStopped => error(StatusCode::SERVICE_UNAVAILABLE, e),
        other => error(StatusCode::CONFLICT, other),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/safe-mode/exit", post(exit_safe_mode_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> Response {
    state.metrics.api_requests.with_label_values(&["status"]).inc();
    match state.service.status().await {
        Ok(p2p) => Json(StatusResponse {
            version: state.version.clone(),
            network: state.network.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            p2p,
        })
        .into_response(),
        Err(e) => service_error(e),
    }
}

/// `POST /safe-mode/exit`: the operator accepts or rejects the held branch.
/// The service decides which; see `SyncCoordinator::exit_safe_mode`.
async fn exit_safe_mode_handler(State(state): State<AppState>) -> Response {
    state
        .metrics
        .api_requests
        .with_label_values(&["safe_mode_exit"])
        .inc();
    if let Err(e) = state.service.exit_safe_mode().await {
        tracing::warn!(error = %e, "safe-mode exit refused");
        return service_error(e);
    }
    tracing::info!("safe mode exited by operator");
    match state.service.status().await {
        Ok(p2p) => Json(p2p).into_response(),
        Err(e) => service_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    use tessera_p2p::config::CHAIN_ID_DEVNET;
    use tessera_p2p::net::service::ServiceOptions;
    use tessera_p2p::sync::chain_view::FixedConsensus;
    use tessera_p2p::types::Hash32;
    use tessera_p2p::wire::BlockHeader;
    use tessera_p2p::{IdentityKeypair, P2pConfig, P2pService};

    use crate::metrics::NodeMetrics;

    fn test_app_state(run: bool) -> AppState {
        let metrics = Arc::new(NodeMetrics::new().unwrap());
        let (service, handle) = P2pService::new(
            P2pConfig::default(),
            Arc::new(IdentityKeypair::ed25519_from_seed(&[7; 32])),
            BlockHeader::genesis(CHAIN_ID_DEVNET, 0, 1_000_000),
            Arc::new(FixedConsensus::new(1_000_000, Hash32::ZERO)),
            ServiceOptions {
                metrics: Some(metrics.p2p.clone()),
                ..ServiceOptions::default()
            },
        );
        if run {
            tokio::spawn(service.run());
        }
        AppState {
            version: "0.1.0-test".into(),
            network: "devnet".into(),
            service: handle,
            metrics,
        }
    }

    async fn send(router: &Router, method: &str, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_app_state(true));
        let (status, body) = send(&router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_genesis_head() {
        let state = test_app_state(true);
        let peer_id = state.service.local_peer_id().to_hex();
        let router = create_router(state);

        let (status, body) = send(&router, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["network"], "devnet");
        assert_eq!(json["peer_id"], peer_id);
        assert_eq!(json["head_height"], 0);
        assert_eq!(json["peers"], 0);
        assert_eq!(json["in_safe_mode"], false);
    }

    #[tokio::test]
    async fn safe_mode_exit_outside_safe_mode_conflicts() {
        let router = create_router(test_app_state(true));
        let (status, body) = send(&router, "POST", "/safe-mode/exit").await;
        assert_eq!(status, StatusCode::CONFLICT);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("safe mode"));
    }

    #[tokio::test]
    async fn stopped_service_is_unavailable() {
        // The service is dropped without running, so its command channel
        // is closed.
        let router = create_router(test_app_state(false));
        let (status, _) = send(&router, "GET", "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let router = create_router(test_app_state(true));
        let _ = send(&router, "GET", "/status").await;
        let (status, body) = send(&router, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("tessera_node_api_requests_total{route=\"status\"} 1"));
        assert!(text.contains("tessera_p2p_connected_peers"));
    }
}
