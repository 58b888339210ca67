//! Tandem API - Dual-Backend Key/Value Service
//!
//! One logical key/value store in front of etcd and PostgreSQL. Writes go to
//! both stores, reads race them behind a local cache, and cache entries are
//! invalidated across instances through a reserved etcd key.
//!
//! The binary in `main.rs` wires the pieces together; everything here is
//! constructed explicitly and passed in, so tests can swap any backend.

pub mod config;
pub mod error;
pub mod extractors;
pub mod jobs;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, ServerConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use extractors::RequestId;
pub use jobs::{invalidation_listener_task, InvalidationListenerConfig, InvalidationListenerMetrics};
pub use routes::create_router;
pub use services::{KeyValueService, ServiceError, ServiceResult};
pub use state::AppState;
pub use types::{Envelope, ListQuery, PutValueRequest, ResponseStatus};
