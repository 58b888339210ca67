//! Local cache
//!
//! A per-instance cache in front of the two stores. Cross-instance
//! coherence is handled by [`crate::invalidation`], not here.

pub mod memory;
pub mod traits;

pub use memory::{CacheConfig, MemoryCache};
pub use traits::{Cache, CacheStats};
