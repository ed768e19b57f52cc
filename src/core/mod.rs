//! Core engine modules - caches and workers
//!
//! These modules know nothing about graphs; stages in `crate::stages` build on them.

pub mod cache_registry;
pub mod frame_lru;
pub mod workers;

// Re-exports for convenience
pub use cache_registry::{CacheEntry, CacheRegistry, CacheStats, DEFAULT_SCOPE_CAPACITY, ScopeCache};
pub use frame_lru::{BlockingLru, FrameLru};
pub use workers::Workers;
