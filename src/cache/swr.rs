//! Stale-while-revalidate read-through cache.
//!
//! Entries move through three freshness states as they age: fresh entries
//! are served directly, stale entries are served immediately while a
//! single background revalidation refreshes them, expired entries block
//! the caller on a foreground fetch.
//!
//! The in-memory layer is authoritative. A persistent file-backed layer
//! can be configured underneath it; every runtime fault in that layer is
//! caught, counted and logged while the memory layer keeps serving.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::cache::store::{CacheStore, FileStore};
use crate::config::{CacheConfig, StorageKind};
use crate::timestamp::Timestamp;

/// Error type produced by fetchers passed to [`Cache::get`].
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Callback observing failed fetches. Receives the cache key and the
/// error, for foreground and background failures alike.
pub type FetchObserver = Arc<dyn Fn(&str, &FetchError) + Send + Sync>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Fetch failed for key {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: FetchError,
    },
}

/// Age classification of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    /// `stale_age` is the length of the stale window that follows
    /// `max_age`, not an absolute bound.
    pub fn classify(age: Duration, max_age: Duration, stale_age: Duration) -> Self {
        if age < max_age {
            Freshness::Fresh
        } else if age < max_age.saturating_add(stale_age) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// Per-call overrides for [`Cache::get_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Bypass freshness entirely and refetch. A forced get counts
    /// neither hit nor miss.
    pub force: bool,
    /// Override the configured fresh window for this lookup.
    pub max_age: Option<Duration>,
}

impl GetOptions {
    pub fn force() -> Self {
        Self {
            force: true,
            max_age: None,
        }
    }

    pub fn max_age(max_age: Duration) -> Self {
        Self {
            force: false,
            max_age: Some(max_age),
        }
    }
}

/// Snapshot of cache activity counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub errors: u64,
    pub entries: usize,
    pub pending_revalidations: usize,
    /// Rounded percentage of lookups served from cache. Zero when no
    /// lookups happened yet.
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    stored_at: Timestamp,
}

struct CacheInner<T> {
    entries: DashMap<String, CacheEntry<T>>,
    /// Keys with a background revalidation in flight. At most one per key.
    pending: DashMap<String, ()>,
    store: Option<Arc<dyn CacheStore>>,
    max_age: Duration,
    stale_age: Duration,
    stale_while_revalidate: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    errors: AtomicU64,
    error_observer: Mutex<Option<FetchObserver>>,
}

/// # Cache
///
/// Read-through cache keyed by strings, generic over the cached value.
///
/// A lookup takes a fetcher closure that is only invoked when the cached
/// entry cannot be served. Stale entries are served immediately and
/// refreshed by a spawned background task, so hot paths never wait on a
/// refetch once a value exists.
///
/// ## Example
///
/// ```rust,no_run
/// # use keel::cache::{Cache, FetchError};
/// # use keel::config::CacheConfig;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cache: Cache<String> = Cache::new(CacheConfig::default());
///
/// let profile = cache
///     .get("profile:u-1", || async {
///         // Called only on miss or expiry.
///         Ok::<String, FetchError>("fetched".to_string())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Cache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Cache<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Creates a cache from configuration.
    ///
    /// With persistent storage configured, the backing directory is
    /// probed once. An unusable directory degrades the cache to
    /// memory-only with a logged warning instead of failing.
    pub fn new(config: CacheConfig) -> Self {
        let store: Option<Arc<dyn CacheStore>> = match config.storage {
            StorageKind::Memory => None,
            StorageKind::Persistent => {
                match FileStore::open(&config.persist_root, &config.namespace) {
                    Ok(file_store) => Some(Arc::new(file_store)),
                    Err(err) => {
                        warn!(
                            namespace = %config.namespace,
                            "Persistent storage unavailable, degrading to memory only: {}",
                            err
                        );
                        None
                    }
                }
            }
        };
        Self::build(config, store)
    }

    /// Creates a cache on top of a caller-provided backend.
    pub fn with_store(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// Installs a callback invoked on every failed fetch, foreground or
    /// background. Replaces any previous observer.
    pub fn set_error_observer(&self, observer: FetchObserver) {
        let mut slot = self
            .inner
            .error_observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(observer);
    }

    fn build(config: CacheConfig, store: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                pending: DashMap::new(),
                store,
                max_age: config.max_age,
                stale_age: config.stale_age,
                stale_while_revalidate: config.stale_while_revalidate,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                revalidations: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                error_observer: Mutex::new(None),
            }),
        }
    }

    /// Looks up `key`, fetching on miss. See [`Cache::get_with`].
    pub async fn get<F, Fut>(&self, key: &str, fetch: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.get_with(key, fetch, GetOptions::default()).await
    }

    /// Looks up `key` with per-call options.
    ///
    /// Fresh entries return a clone without invoking `fetch`. Stale
    /// entries (with stale-while-revalidate enabled) return the old value
    /// immediately and refresh in the background, at most one refresh per
    /// key at a time. Expired or absent entries invoke `fetch` in the
    /// foreground; a failing foreground fetch surfaces as
    /// [`CacheError::Fetch`] without touching any existing entry.
    pub async fn get_with<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: GetOptions,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if options.force {
            debug!(key, "Forced refetch");
            return self.fetch_and_cache(key, fetch).await;
        }

        let max_age = options.max_age.unwrap_or(self.inner.max_age);
        if let Some(entry) = self.inner.lookup(key) {
            match Freshness::classify(entry.stored_at.age(), max_age, self.inner.stale_age) {
                Freshness::Fresh => {
                    trace!(key, "Cache hit (fresh)");
                    self.inner.hits.fetch_add(1, Ordering::SeqCst);
                    return Ok(entry.data);
                }
                Freshness::Stale if self.inner.stale_while_revalidate => {
                    trace!(key, "Cache hit (stale), revalidating");
                    self.inner.hits.fetch_add(1, Ordering::SeqCst);
                    self.spawn_revalidation(key, fetch);
                    return Ok(entry.data);
                }
                _ => {}
            }
        }

        self.inner.misses.fetch_add(1, Ordering::SeqCst);
        self.fetch_and_cache(key, fetch).await
    }

    /// Current value for `key` with no fetch and no hit or miss
    /// accounting.
    pub fn peek(&self, key: &str) -> Option<T> {
        self.inner.lookup(key).map(|entry| entry.data)
    }

    /// Inserts a value directly, as if it had just been fetched.
    pub fn set(&self, key: &str, value: T) {
        self.inner.insert_entry(key, value);
    }

    /// Removes `key` from both layers and drops its pending-revalidation
    /// marker. A revalidation fetch already in flight is not cancelled;
    /// its completion may reinsert the key.
    ///
    /// Returns whether the key was present in either layer.
    pub fn invalidate(&self, key: &str) -> bool {
        let in_memory = self.inner.entries.remove(key).is_some();
        self.inner.pending.remove(key);

        let mut in_store = false;
        if let Some(store) = &self.inner.store {
            in_store = matches!(store.load(key), Ok(Some(_)));
            if let Err(err) = store.remove(key) {
                self.inner.record_store_fault("remove", key, &err);
            }
        }

        debug!(key, "Invalidated");
        in_memory || in_store
    }

    /// Removes every entry whose key contains `pattern`. Returns how many
    /// distinct keys were removed.
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let mut keys: HashSet<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().contains(pattern))
            .map(|entry| entry.key().clone())
            .collect();

        if let Some(store) = &self.inner.store {
            match store.keys() {
                Ok(stored) => keys.extend(stored.into_iter().filter(|key| key.contains(pattern))),
                Err(err) => self.inner.record_store_fault("scan", pattern, &err),
            }
        }

        for key in &keys {
            self.invalidate(key);
        }
        debug!(pattern, removed = keys.len(), "Invalidated matching keys");
        keys.len()
    }

    /// Removes all entries. Returns how many distinct keys were removed.
    pub fn clear(&self) -> usize {
        let mut keys: HashSet<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.inner.entries.clear();
        self.inner.pending.clear();

        if let Some(store) = &self.inner.store {
            match store.keys() {
                Ok(stored) => {
                    for key in stored {
                        if let Err(err) = store.remove(&key) {
                            self.inner.record_store_fault("remove", &key, &err);
                        }
                        keys.insert(key);
                    }
                }
                Err(err) => self.inner.record_store_fault("scan", "*", &err),
            }
        }

        debug!(removed = keys.len(), "Cache cleared");
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::SeqCst);
        let misses = self.inner.misses.load(Ordering::SeqCst);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (hits as f64 / lookups as f64 * 100.0).round()
        };
        CacheStats {
            hits,
            misses,
            revalidations: self.inner.revalidations.load(Ordering::SeqCst),
            errors: self.inner.errors.load(Ordering::SeqCst),
            entries: self.inner.entries.len(),
            pending_revalidations: self.inner.pending.len(),
            hit_rate,
        }
    }

    pub fn reset_stats(&self) {
        self.inner.hits.store(0, Ordering::SeqCst);
        self.inner.misses.store(0, Ordering::SeqCst);
        self.inner.revalidations.store(0, Ordering::SeqCst);
        self.inner.errors.store(0, Ordering::SeqCst);
    }

    /// Number of entries in the in-memory layer.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether a persistent layer is active. False after a degrade.
    pub fn is_persistent(&self) -> bool {
        self.inner.store.is_some()
    }

    async fn fetch_and_cache<F, Fut>(&self, key: &str, fetch: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        match fetch().await {
            Ok(data) => {
                self.inner.insert_entry(key, data.clone());
                Ok(data)
            }
            Err(source) => {
                self.inner.errors.fetch_add(1, Ordering::SeqCst);
                self.inner.notify_error(key, &source);
                Err(CacheError::Fetch {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    fn spawn_revalidation<F, Fut>(&self, key: &str, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        match self.inner.pending.entry(key.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }
        self.inner.revalidations.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            debug!(key = %key, "Revalidating in background");
            match fetch().await {
                Ok(data) => inner.insert_entry(&key, data),
                Err(err) => {
                    inner.errors.fetch_add(1, Ordering::SeqCst);
                    inner.notify_error(&key, &err);
                    warn!(key = %key, "Background revalidation failed, keeping stale entry: {}", err);
                }
            }
            inner.pending.remove(&key);
        });
    }
}

impl<T> CacheInner<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn lookup(&self, key: &str) -> Option<CacheEntry<T>> {
        if let Some(entry) = self.entries.get(key) {
            return Some(entry.clone());
        }

        let store = self.store.as_ref()?;
        match store.load(key) {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry<T>>(&raw) {
                Ok(entry) => {
                    // Promote so later lookups skip the disk read.
                    self.entries.insert(key.to_string(), entry.clone());
                    Some(entry)
                }
                Err(err) => {
                    self.record_store_fault("decode", key, &err.into());
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.record_store_fault("load", key, &err);
                None
            }
        }
    }

    fn insert_entry(&self, key: &str, data: T) {
        let entry = CacheEntry {
            data,
            stored_at: Timestamp::now(),
        };
        if let Some(store) = &self.store {
            match serde_json::to_string(&entry) {
                Ok(serialized) => {
                    if let Err(err) = store.store(key, &serialized) {
                        self.record_store_fault("write", key, &err);
                    }
                }
                Err(err) => self.record_store_fault("encode", key, &err.into()),
            }
        }
        // The memory layer keeps the entry even when persistence failed.
        self.entries.insert(key.to_string(), entry);
    }

    fn record_store_fault(&self, op: &str, key: &str, err: &crate::cache::StorageError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        warn!(op, key, "Persistent layer fault: {}", err);
    }

    fn notify_error(&self, key: &str, err: &FetchError) {
        // Clone out so the callback never runs under the lock.
        let observer = self
            .error_observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(observer) = observer {
            observer(key, err);
        }
    }
}
