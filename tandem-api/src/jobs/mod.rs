//! Background Jobs for tandem API
//!
//! - `invalidation_listener`: Evicts keys announced on the invalidation bus
//!
//! # Usage
//!
//! ```ignore
//! use tandem_api::jobs::{invalidation_listener_task, InvalidationListenerConfig, InvalidationListenerMetrics};
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let metrics = Arc::new(InvalidationListenerMetrics::new());
//! tokio::spawn(invalidation_listener_task(
//!     service.clone(),
//!     bus.clone(),
//!     InvalidationListenerConfig::from_env()?,
//!     metrics.clone(),
//!     shutdown.clone(),
//! ));
//!
//! // On shutdown
//! shutdown.cancel();
//! ```

pub mod invalidation_listener;

pub use invalidation_listener::{
    invalidation_listener_task, InvalidationListenerConfig, InvalidationListenerMetrics,
    InvalidationListenerSnapshot,
};
