//! # Data Cache
//!
//! Read-through caching with stale-while-revalidate semantics. An entry
//! ages through three states:
//!
//! ```text
//!  stored ──(max_age)──▶ stale ──(stale_age)──▶ expired
//!   fresh: serve         serve + refresh          refetch in
//!   from memory          in background            foreground
//! ```
//!
//! The in-memory layer always serves. A persistent file-backed layer can
//! sit underneath it for warm starts; an unusable backing directory
//! degrades the cache to memory-only at construction, and runtime storage
//! faults are counted and logged without ever reaching callers.
//!
//! See [`Cache`] for the lookup API and [`CacheStore`] for custom
//! backends.

mod store;
mod swr;

pub use store::{CacheStore, FileStore, MemoryStore, StorageError};
pub use swr::{Cache, CacheError, CacheStats, FetchError, FetchObserver, Freshness, GetOptions};
