use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};
use strum_macros::{Display, EnumString};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub event_bus: EventBusConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_bus: EventBusConfig::default(),
            cache: CacheConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        from_file(path)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        from_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Emitted events retained for inspection and replay. Oldest entries
    /// are evicted once the bound is reached.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries younger than this are fresh and served without refetching.
    #[serde(default = "default_max_age", with = "duration_ms")]
    pub max_age: Duration,

    /// Length of the stale window that follows `max_age`. Entries in it
    /// are still servable while a background revalidation runs; past
    /// `max_age + stale_age` they are expired.
    #[serde(default = "default_stale_age", with = "duration_ms")]
    pub stale_age: Duration,

    #[serde(default = "default_true")]
    pub stale_while_revalidate: bool,

    #[serde(default)]
    pub storage: StorageKind,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Directory that holds persisted namespaces when `storage` is
    /// `persistent`.
    #[serde(default = "default_persist_root")]
    pub persist_root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            stale_age: default_stale_age(),
            stale_while_revalidate: default_true(),
            storage: StorageKind::default(),
            namespace: default_namespace(),
            persist_root: default_persist_root(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Calls admitted per rate-limit window; overflow is queued.
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: u32,

    #[serde(default = "default_window", with = "duration_ms")]
    pub window: Duration,

    /// Retry attempts after the first try, for calls that do not override it.
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    #[serde(default = "default_timeout", with = "duration_ms")]
    pub default_timeout: Duration,

    #[serde(default = "default_backoff_base", with = "duration_ms")]
    pub backoff_base: Duration,

    #[serde(default = "default_backoff_cap", with = "duration_ms")]
    pub backoff_cap: Duration,

    /// Response-cache TTL applied when a call does not set one. Zero
    /// disables response caching.
    #[serde(default = "default_cache_ttl", with = "duration_ms")]
    pub default_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: default_max_requests_per_window(),
            window: default_window(),
            default_retries: default_retries(),
            default_timeout: default_timeout(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            default_cache_ttl: default_cache_ttl(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_max_history() -> usize {
    100
}
fn default_max_age() -> Duration {
    Duration::from_secs(300)
}
fn default_stale_age() -> Duration {
    Duration::from_secs(600)
}
fn default_true() -> bool {
    true
}
fn default_namespace() -> String {
    "cache".to_string()
}
fn default_persist_root() -> PathBuf {
    PathBuf::from(".keel")
}
fn default_max_requests_per_window() -> u32 {
    10
}
fn default_window() -> Duration {
    Duration::from_secs(1)
}
fn default_retries() -> u32 {
    3
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}
fn default_backoff_cap() -> Duration {
    Duration::from_secs(10)
}
fn default_cache_ttl() -> Duration {
    Duration::ZERO
}

// Duration serde helper: integer milliseconds on the wire.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
