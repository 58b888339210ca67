//! Health Check Endpoints
//!
//! - /health/ping - Simple liveness check
//! - /health/stats - Cache and invalidation counters for this instance

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::jobs::InvalidationListenerSnapshot;
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub cache: CacheReport,
    pub invalidation: InvalidationListenerSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    /// Hits since the last invalidation
    pub hit_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: u64,
    pub memory_bytes: u64,
    pub evictions: u64,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping - Simple pong response
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/stats
///
/// Degraded means the listener has never managed to subscribe, so this
/// instance may serve stale cache entries.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.service.cache_stats().await;
    let invalidation = state.listener_metrics.snapshot();

    let status = if invalidation.subscriptions == 0 && invalidation.subscribe_failures > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let response = StatsResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        cache: CacheReport {
            hit_count: state.service.hit_count(),
            hits: cache.hits,
            misses: cache.misses,
            hit_rate: cache.hit_rate(),
            entries: cache.entry_count,
            memory_bytes: cache.memory_bytes,
            evictions: cache.evictions,
        },
        invalidation,
    };

    (StatusCode::OK, Json(response))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats))
}
