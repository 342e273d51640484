use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use keel::config::{CacheConfig, StorageKind};
use keel::{Cache, CacheError, FetchError, GetOptions};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn memory_config(max_age_ms: u64, stale_age_ms: u64) -> CacheConfig {
    CacheConfig {
        max_age: Duration::from_millis(max_age_ms),
        stale_age: Duration::from_millis(stale_age_ms),
        ..CacheConfig::default()
    }
}

type BoxedFetch =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send>> + Send>;

/// Fetch closure that counts how often it actually runs.
fn counting(calls: &Arc<AtomicUsize>, value: &'static str) -> BoxedFetch {
    let calls = calls.clone();
    Box::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(value.to_string()) })
    })
}

async fn failing() -> Result<String, FetchError> {
    Err("backend offline".into())
}

#[tokio::test]
async fn test_stale_while_revalidate_timeline() {
    // Fresh below 100ms, stale until 100 + 150 = 250ms, expired past that.
    let cache: Cache<String> = Cache::new(memory_config(100, 150));
    let calls = Arc::new(AtomicUsize::new(0));

    // Cold: fetches in the foreground.
    let value = cache.get("report", counting(&calls, "v1")).await.unwrap();
    assert_eq!(value, "v1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Fresh: served without fetching.
    sleep(Duration::from_millis(50)).await;
    let value = cache.get("report", counting(&calls, "unused")).await.unwrap();
    assert_eq!(value, "v1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Stale: the old value comes back immediately, the fetch runs in
    // the background.
    sleep(Duration::from_millis(60)).await;
    let value = cache.get("report", counting(&calls, "v2")).await.unwrap();
    assert_eq!(value, "v1");

    sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let value = cache.get("report", counting(&calls, "unused")).await.unwrap();
    assert_eq!(value, "v2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Expired: back to a blocking foreground fetch.
    sleep(Duration::from_millis(300)).await;
    let value = cache.get("report", counting(&calls, "v3")).await.unwrap();
    assert_eq!(value, "v3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.revalidations, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.hit_rate, 60.0);
}

#[tokio::test]
async fn test_failed_revalidation_keeps_serving_the_old_value() {
    let cache: Cache<String> = Cache::new(memory_config(40, 10_000));
    let calls = Arc::new(AtomicUsize::new(0));

    cache.get("k", counting(&calls, "v1")).await.unwrap();
    sleep(Duration::from_millis(60)).await;

    // Stale read with a broken backend.
    let value = cache.get("k", || failing()).await.unwrap();
    assert_eq!(value, "v1");

    sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.peek("k"), Some("v1".to_string()));
    assert_eq!(cache.stats().errors, 1);
}

#[tokio::test]
async fn test_foreground_fetch_failure_surfaces_and_caches_nothing() {
    let cache: Cache<String> = Cache::new(memory_config(100, 200));

    let err = cache.get("k", || failing()).await.unwrap_err();
    assert!(matches!(err, CacheError::Fetch { .. }));
    assert!(err.to_string().contains("backend offline"));

    assert_eq!(cache.peek("k"), None);
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.hit_rate, 0.0);
}

#[tokio::test]
async fn test_force_bypasses_freshness_and_counters() {
    let cache: Cache<String> = Cache::new(memory_config(10_000, 20_000));
    let calls = Arc::new(AtomicUsize::new(0));

    cache.get("k", counting(&calls, "v1")).await.unwrap();
    let value = cache
        .get_with("k", counting(&calls, "v2"), GetOptions::force())
        .await
        .unwrap();

    assert_eq!(value, "v2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.peek("k"), Some("v2".to_string()));

    // A forced fetch is neither a hit nor a miss.
    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);
}

fn persistent_config(root: &std::path::Path, namespace: &str) -> CacheConfig {
    CacheConfig {
        max_age: Duration::from_secs(60),
        stale_age: Duration::from_secs(120),
        storage: StorageKind::Persistent,
        namespace: namespace.to_string(),
        persist_root: root.to_path_buf(),
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn test_persistent_entries_survive_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let cache: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
        assert!(cache.is_persistent());
        cache.get("orders:1", counting(&calls, "persisted")).await.unwrap();
    }

    // A new cache over the same directory hydrates from disk.
    let cache: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
    let value = cache
        .get("orders:1", counting(&calls, "refetched"))
        .await
        .unwrap();
    assert_eq!(value, "persisted");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unusable_store_degrades_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, b"file, not a directory").unwrap();

    // The namespace cannot be created underneath a plain file.
    let config = persistent_config(&blocker, "orders");
    let cache: Cache<String> = Cache::new(config);
    assert!(!cache.is_persistent());

    cache.set("k", "still works".to_string());
    assert_eq!(cache.peek("k"), Some("still works".to_string()));
}

#[tokio::test]
async fn test_invalidation_reaches_the_persistent_layer() {
    let dir = tempfile::tempdir().unwrap();

    {
        let cache: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
        cache.set("orders:1", "a".to_string());
        cache.set("orders:2", "b".to_string());
        cache.set("profile:1", "c".to_string());

        assert!(cache.invalidate("orders:1"));
        assert!(!cache.invalidate("orders:1"));
    }

    let cache: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
    assert_eq!(cache.peek("orders:1"), None);
    assert_eq!(cache.peek("orders:2"), Some("b".to_string()));

    assert_eq!(cache.invalidate_matching("orders:"), 1);
    assert_eq!(cache.clear(), 1);

    let empty: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
    assert_eq!(empty.peek("orders:2"), None);
    assert_eq!(empty.peek("profile:1"), None);
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();

    let orders: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
    let profiles: Cache<String> = Cache::new(persistent_config(dir.path(), "profiles"));

    orders.set("1", "order".to_string());
    profiles.set("1", "profile".to_string());

    let orders_again: Cache<String> = Cache::new(persistent_config(dir.path(), "orders"));
    assert_eq!(orders_again.peek("1"), Some("order".to_string()));

    orders_again.clear();
    let profiles_again: Cache<String> = Cache::new(persistent_config(dir.path(), "profiles"));
    assert_eq!(profiles_again.peek("1"), Some("profile".to_string()));
}
