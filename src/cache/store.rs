//! Storage backends for the persistent cache layer.
//!
//! Backends are synchronous string key-value stores with explicit errors.
//! The cache treats every runtime storage fault as survivable: failures
//! are logged and counted while the in-memory layer keeps serving.

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored value malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous key-value backend behind the cache's persistent layer.
///
/// Implementations must tolerate arbitrary key strings; values are opaque
/// serialized entries.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn store(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// All keys currently stored, in no particular order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-process backend. Infallible in practice; exists so memory-only and
/// persistent configurations share one code path in tests.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).map(|value| value.clone()))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.values.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// Envelope written to disk. Carries the original key because file names
/// are sanitized and hashed.
#[derive(Serialize, Deserialize)]
struct FileEnvelope {
    key: String,
    value: String,
}

/// One JSON file per key under `<root>/<namespace>/`.
///
/// [`FileStore::open`] probes the directory with a write-and-remove cycle
/// and fails when it is unusable; the cache degrades to memory-only in
/// that case.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(root: &Path, namespace: &str) -> Result<Self, StorageError> {
        let dir = root.join(namespace);
        fs::create_dir_all(&dir)?;

        let probe = dir.join(".probe");
        fs::write(&probe, b"probe")?;
        fs::remove_file(&probe)?;

        debug!(dir = %dir.display(), "Opened file store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    // Readable prefix plus a digest of the full key. Uniqueness comes
    // from the envelope's key check, not the digest alone.
    fn file_name(key: &str) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let digest = hasher.finish();

        let prefix: String = key
            .chars()
            .take(40)
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{:016x}.json", prefix, digest)
    }

    fn read_envelope(path: &Path) -> Result<FileEnvelope, StorageError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl CacheStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let envelope = Self::read_envelope(&path)?;
        if envelope.key != key {
            // Digest collision; the file belongs to another key.
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let envelope = FileEnvelope {
            key: key.to_string(),
            value: value.to_string(),
        };
        let serialized = serde_json::to_string(&envelope)?;
        fs::write(self.path_for(key), serialized)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            // Unreadable files are skipped rather than failing the scan.
            if let Ok(envelope) = Self::read_envelope(&path) {
                keys.push(envelope.key);
            }
        }
        Ok(keys)
    }
}
