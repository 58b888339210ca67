//! Cache Invalidation Listener
//!
//! One long-lived task per process. It subscribes to the invalidation bus
//! and evicts every announced key from the local cache. When the
//! subscription ends or fails it re-subscribes after a back-off, doubling up
//! to a ceiling, until the shutdown token is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tandem_core::ConfigError;
use tandem_storage::InvalidationBus;
use tokio_util::sync::CancellationToken;

use crate::config::env_duration_ms;
use crate::services::KeyValueService;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the invalidation listener.
#[derive(Debug, Clone)]
pub struct InvalidationListenerConfig {
    /// Delay before the first re-subscribe attempt (default: 1 second)
    pub resubscribe_backoff: Duration,

    /// Upper bound for the doubling back-off (default: 30 seconds)
    pub max_backoff: Duration,
}

impl Default for InvalidationListenerConfig {
    fn default() -> Self {
        Self {
            resubscribe_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl InvalidationListenerConfig {
    /// Create config from environment variables.
    ///
    /// # Environment Variables
    /// - `TANDEM_INVALIDATION_BACKOFF_MS`: First re-subscribe delay (default: 1000)
    /// - `TANDEM_INVALIDATION_MAX_BACKOFF_MS`: Back-off ceiling (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            resubscribe_backoff: env_duration_ms("TANDEM_INVALIDATION_BACKOFF_MS")?
                .unwrap_or(defaults.resubscribe_backoff),
            max_backoff: env_duration_ms("TANDEM_INVALIDATION_MAX_BACKOFF_MS")?
                .unwrap_or(defaults.max_backoff),
        };
        if config.max_backoff < config.resubscribe_backoff {
            return Err(ConfigError::invalid(
                "TANDEM_INVALIDATION_MAX_BACKOFF_MS",
                "must not be below TANDEM_INVALIDATION_BACKOFF_MS",
            ));
        }
        Ok(config)
    }

    /// Short back-offs for development and tests.
    pub fn development() -> Self {
        Self {
            resubscribe_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct InvalidationListenerMetrics {
    /// Keys evicted from the local cache
    pub events_applied: AtomicU64,

    /// Subscriptions opened, the first one included
    pub subscriptions: AtomicU64,

    /// Subscribe attempts that failed
    pub subscribe_failures: AtomicU64,

    /// Subscriptions that ended with an error
    pub stream_errors: AtomicU64,
}

impl InvalidationListenerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> InvalidationListenerSnapshot {
        InvalidationListenerSnapshot {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct InvalidationListenerSnapshot {
    pub events_applied: u64,
    pub subscriptions: u64,
    pub subscribe_failures: u64,
    pub stream_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Apply invalidation announcements to `service` until `shutdown` fires.
///
/// Returns the metrics handle it was given, for a final report.
pub async fn invalidation_listener_task(
    service: Arc<KeyValueService>,
    bus: Arc<dyn InvalidationBus>,
    config: InvalidationListenerConfig,
    metrics: Arc<InvalidationListenerMetrics>,
    shutdown: CancellationToken,
) -> Arc<InvalidationListenerMetrics> {
    tracing::info!(
        backoff_ms = config.resubscribe_backoff.as_millis() as u64,
        max_backoff_ms = config.max_backoff.as_millis() as u64,
        "Invalidation listener started"
    );

    let mut backoff = config.resubscribe_backoff;

    'outer: loop {
        let subscribed = tokio::select! {
            _ = shutdown.cancelled() => break 'outer,
            subscribed = bus.subscribe() => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                metrics.subscriptions.fetch_add(1, Ordering::Relaxed);
                backoff = config.resubscribe_backoff;
                tracing::debug!("Subscribed to cache invalidations");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'outer,
                        next = stream.next() => match next {
                            Some(Ok(key)) => {
                                service.apply_invalidation(&key).await;
                                metrics.events_applied.fetch_add(1, Ordering::Relaxed);
                            }
                            Some(Err(e)) => {
                                metrics.stream_errors.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(error = %e, "Invalidation stream failed");
                                break;
                            }
                            None => {
                                tracing::warn!("Invalidation stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                metrics.subscribe_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Failed to subscribe to invalidations");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break 'outer,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        events_applied = snapshot.events_applied,
        subscriptions = snapshot.subscriptions,
        subscribe_failures = snapshot.subscribe_failures,
        stream_errors = snapshot.stream_errors,
        "Invalidation listener stopped"
    );

    metrics
}
