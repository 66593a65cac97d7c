//! Content-aware step output cache.
//!
//! - [`derive_key`] turns a step invocation into a deterministic key
//! - [`CacheStore`] backends hold entries that reference stored artifacts
//! - [`CacheManager`] ties both together and guards each key with a writer lock

mod key;
mod manager;
mod store;

pub use key::{derive_key, CacheKey, CacheStrategy};
pub use manager::{CacheDecision, CacheManager, CacheStats, KeyGuard};
pub use store::{CacheEntry, CacheMetadata, CacheStore, FileCacheStore, InMemoryCacheStore};
