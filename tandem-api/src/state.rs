//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::jobs::InvalidationListenerMetrics;
use crate::services::KeyValueService;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<KeyValueService>,
    /// Counters of the process's invalidation listener, for `/health/stats`.
    pub listener_metrics: Arc<InvalidationListenerMetrics>,
    /// Deadline applied to each service call.
    pub request_timeout: Duration,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        service: Arc<KeyValueService>,
        listener_metrics: Arc<InvalidationListenerMetrics>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service,
            listener_metrics,
            request_timeout,
            start_time: Instant::now(),
        }
    }
}
