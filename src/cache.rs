//! Bucketed key/value store memoizing expensive git invocations.
//!
//! Payloads can also be mirrored as flat files named after their key, so a
//! later run can rehydrate the buckets with [`CacheStore::warmup`] instead of
//! re-running git.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const DIFF_BUCKET: &str = "diff";
pub const FILE_LIST_BUCKET: &str = "file_modified_diff";
pub const BLAME_BUCKET: &str = "blame";

pub fn diff_key(parent: &str, child: &str) -> String {
    format!("diff_{}{}", parent, child)
}

pub fn file_list_key(parent: &str, child: &str) -> String {
    format!("file_modified_diff_{}{}", parent, child)
}

pub fn blame_key(line: u32, commit: &str, file: &str) -> String {
    format!("blame_{}_{}_{}", line, commit, file.replace('/', "_"))
}

/// Counters for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub name: String,
    pub elements: usize,
    pub hits: usize,
    pub misses: usize,
}

#[derive(Default)]
struct Bucket {
    values: HashMap<String, String>,
    stats: BucketStats,
}

impl Bucket {
    fn named(name: &str) -> Self {
        Self {
            values: HashMap::new(),
            stats: BucketStats {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }
}

/// Thread-safe cache shared by the history scan and all linking workers.
pub struct CacheStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    persist_dir: Option<PathBuf>,
}

impl CacheStore {
    /// In-memory only cache.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            persist_dir: None,
        }
    }

    /// Cache that mirrors persisted entries under `dir`.
    pub fn with_persistence(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            buckets: Mutex::new(HashMap::new()),
            persist_dir: Some(dir),
        })
    }

    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    pub fn put(&self, bucket: &str, key: &str, value: impl Into<String>) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Bucket::named(bucket));
        if bucket.values.insert(key.to_string(), value.into()).is_none() {
            bucket.stats.elements += 1;
        }
    }

    /// Store in memory and, when a persistence directory is configured, write
    /// the payload to a file named after the key. Disk failures are logged only.
    pub async fn put_persisted(&self, bucket: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(dir) = &self.persist_dir {
            if let Err(e) = tokio::fs::write(dir.join(key), value.as_bytes()).await {
                tracing::warn!("Failed to persist cache entry {}: {}", key, e);
            }
        }
        self.put(bucket, key, value);
    }

    pub fn fetch(&self, bucket: &str, key: &str) -> Option<String> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Bucket::named(bucket));
        match bucket.values.get(key) {
            Some(value) => {
                bucket.stats.hits += 1;
                Some(value.clone())
            }
            None => {
                bucket.stats.misses += 1;
                None
            }
        }
    }

    pub fn stats(&self, bucket: &str) -> BucketStats {
        self.buckets
            .lock()
            .get(bucket)
            .map(|b| b.stats.clone())
            .unwrap_or_else(|| BucketStats {
                name: bucket.to_string(),
                ..Default::default()
            })
    }

    /// Load every persisted diff, file-list and blame payload found in `dir`.
    /// Returns the number of entries loaded.
    pub fn warmup(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();

            // file_modified_diff_ must be checked before diff_
            let bucket = if name.starts_with("file_modified_diff_") {
                FILE_LIST_BUCKET
            } else if name.starts_with("diff_") {
                DIFF_BUCKET
            } else if name.starts_with("blame_") {
                BLAME_BUCKET
            } else {
                tracing::debug!("Skipping non-cache file {}", name);
                continue;
            };

            match fs::read_to_string(entry.path()) {
                Ok(content) => {
                    self.put(bucket, &name, content);
                    loaded += 1;
                }
                Err(e) => tracing::warn!("Unreadable cache file {}: {}", name, e),
            }
        }

        tracing::info!("Warmed up cache with {} entries from {:?}", loaded, dir);
        Ok(loaded)
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
