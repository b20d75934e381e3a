//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint reporting the multiplexer's feeds and serving Prometheus
//! metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status with the active feeds
//! - `GET /healthz` - liveness check (simple OK)
//! - `GET /readyz` - readiness check, ready once any feed is live
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::StreamManager;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"serving"` with at least one live feed, `"idle"` otherwise.
    pub status: HealthStatus,
    /// Binary version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Keys of the live feeds.
    pub feeds: Vec<String>,
}

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// At least one feed is live.
    Serving,
    /// No feed is live.
    Idle,
}

// =============================================================================
// Server State
// =============================================================================

/// State shared by the handlers.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    streams: StreamManager,
}

impl HealthServerState {
    /// State reporting on `streams`.
    #[must_use]
    pub fn new(version: String, streams: StreamManager) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            streams,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// fails while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(build_health_response(&state)))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.streams.active_feeds().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feeds: Vec<String> = state
        .streams
        .active_feeds()
        .iter()
        .map(ToString::to_string)
        .collect();

    HealthResponse {
        status: if feeds.is_empty() {
            HealthStatus::Idle
        } else {
            HealthStatus::Serving
        },
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        feeds,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use futures::FutureExt;
    use futures::future;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::MockTransport;
    use crate::application::services::StreamManagerConfig;
    use crate::infrastructure::deriv::TicksHistoryRequest;
    use crate::infrastructure::metrics::{init_metrics, set_active_feeds};

    fn state(feeds: &[&str]) -> Arc<HealthServerState> {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|_| future::pending().boxed());
        let streams = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());
        for symbol in feeds {
            let request = TicksHistoryRequest {
                ticks_history: (*symbol).to_string(),
                ..TicksHistoryRequest::default()
            };
            streams.prime(&request).unwrap();
        }
        Arc::new(HealthServerState::new("0.1.0".to_string(), streams))
    }

    async fn get_body(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Serving).unwrap(),
            "\"serving\""
        );
        assert_eq!(serde_json::to_string(&HealthStatus::Idle).unwrap(), "\"idle\"");
    }

    #[tokio::test]
    async fn health_lists_active_feeds() {
        let (status, body) = get_body(state(&["R_50", "R_100"]), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["status"], "serving");
        assert_eq!(body["feeds"], json!(["R_100-0", "R_50-0"]));
        assert_eq!(body["version"], "0.1.0");
    }

    #[tokio::test]
    async fn readiness_follows_feeds() {
        let (status, _) = get_body(state(&[]), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = get_body(state(&["R_100"]), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");

        let (status, _) = get_body(state(&[]), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_are_rendered() {
        init_metrics().unwrap();
        set_active_feeds(2);

        let (status, body) = get_body(state(&[]), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("quote_mux_active_feeds"));
    }
}
