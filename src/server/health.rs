//! Health, readiness and metrics endpoints
//!
//! - `/healthz` - Liveness: the process is serving HTTP
//! - `/readyz` - Readiness: the Experiment controller has started
//! - `/metrics` - Prometheus text format

use crate::server::metrics::SharedMetrics;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Whether this replica should receive `/readyz` traffic
///
/// `main` flips it on just before the Experiment `Controller` starts and
/// off as soon as a termination signal arrives. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct ReadinessState(Arc<AtomicBool>);

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

async fn readyz(State(state): State<ServerState>) -> StatusCode {
    match state.readiness.is_ready() {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics(
    State(state): State<ServerState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let body = state.metrics.encode().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        )
    })?;
    Ok(([(CONTENT_TYPE, PROMETHEUS_TEXT)], body))
}

pub(crate) fn build_router(readiness: ReadinessState, metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .with_state(ServerState { readiness, metrics })
}

/// Bind `0.0.0.0:port` and serve until the task is aborted
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> Result<(), std::io::Error> {
    let app = build_router(readiness, metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Serving /healthz, /readyz and /metrics");

    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
