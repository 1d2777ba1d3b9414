//! Health Check and Metrics Endpoint
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of the feed, registry, pool and tasks
//! - `GET /healthz` - liveness probe
//! - `GET /readyz` - ready when the feed is connected or nothing is streamed
//! - `GET /metrics` - Prometheus text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::materializer::CacheMaterializer;
use crate::application::services::progress::{ProgressTracker, TaskProgress, TaskStatus};
use crate::application::services::worker_pool::{PoolStats, WorkerPool};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::exchange::{ConnectionSnapshot, ConnectionState, ConnectionStatus};
use crate::infrastructure::metrics::metrics_handle;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Package version.
    pub version: String,
    /// Seconds since the server state was created.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Exchange feed connection.
    pub feed: ConnectionSnapshot,
    /// Registry counts.
    pub subscriptions: SubscriptionCounts,
    /// Worker pool counters.
    pub pool: PoolStats,
    /// Materializations running in this process.
    pub materializations_in_flight: usize,
    /// Tracked tasks still running.
    pub tasks: Vec<TaskProgress>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed connected, or nothing to stream.
    Healthy,
    /// Feed between sessions.
    Degraded,
    /// Feed gave up reconnecting while streams are wanted.
    Unhealthy,
}

/// Registry counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubscriptionCounts {
    /// Subscription rows.
    pub rows: usize,
    /// Rows that cannot be removed.
    pub pinned: usize,
    /// Distinct users.
    pub users: usize,
    /// Streams the feed should carry.
    pub feed_streams: usize,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: Arc<ConnectionStatus>,
    registry: Arc<SubscriptionRegistry>,
    pool: WorkerPool,
    materializer: Arc<CacheMaterializer>,
    progress: Arc<ProgressTracker>,
}

impl std::fmt::Debug for HealthServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthServerState")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl HealthServerState {
    /// Create server state.
    #[must_use]
    pub fn new(
        version: impl Into<String>,
        feed: Arc<ConnectionStatus>,
        registry: Arc<SubscriptionRegistry>,
        pool: WorkerPool,
        materializer: Arc<CacheMaterializer>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            feed,
            registry,
            pool,
            materializer,
            progress,
        }
    }

    fn is_ready(&self) -> bool {
        self.feed.state() == ConnectionState::Connected || !self.registry.has_streamed_assets()
    }
}

// =============================================================================
// Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the server stops with
    /// an error.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the router.
pub fn router(state: Arc<HealthServerState>) -> Router {
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
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    metrics_handle().map_or_else(
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
    let feed = state.feed.snapshot();
    let streamed = state.registry.feed_streams().len();
    let stats = state.registry.stats();

    HealthResponse {
        status: determine_health_status(feed.state, streamed > 0),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        subscriptions: SubscriptionCounts {
            rows: stats.row_count,
            pinned: stats.pinned_count,
            users: stats.user_count,
            feed_streams: streamed,
        },
        pool: state.pool.stats(),
        materializations_in_flight: state.materializer.in_flight(),
        tasks: state
            .progress
            .list()
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect(),
    }
}

const fn determine_health_status(state: ConnectionState, wants_stream: bool) -> HealthStatus {
    if !wants_stream {
        return HealthStatus::Healthy;
    }
    match state {
        ConnectionState::Connected => HealthStatus::Healthy,
        ConnectionState::Error => HealthStatus::Unhealthy,
        ConnectionState::Disconnected
        | ConnectionState::Connecting
        | ConnectionState::Closed
        | ConnectionState::Reconnecting => HealthStatus::Degraded,
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
