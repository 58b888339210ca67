//! Services
//!
//! Business logic sitting between the HTTP routes and the repositories.

pub mod key_value_service;

pub use key_value_service::{KeyValueService, ServiceError, ServiceResult};
