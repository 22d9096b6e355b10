//! TTL cache for raw payloads with per-key disk persistence
//!
//! One JSON file per cache key so a process restart does not refetch
//! everything. TTL is evaluated lazily at `get` time; there is no
//! background sweep. Volume is one entry per endpoint, so no LRU.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::model::RawPayload;

/// One cached payload. Never mutated in place; `put` replaces wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: RawPayload,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_at).num_seconds() < self.ttl_secs as i64
    }
}

/// Shared cache handle, safe for concurrent use from all collector loops.
#[derive(Clone)]
pub struct CacheStore {
    dir: PathBuf,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl CacheStore {
    /// Open (and create if needed) the cache directory. Entry files are
    /// loaded lazily on first `get` per key, not up front.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self {
            dir,
            entries: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Look up a fresh entry. An expired entry counts as a miss and is
    /// evicted from memory on access; its file stays until the next `put`
    /// so `get_stale` keeps working across restarts.
    pub async fn get(&self, key: &str) -> Option<RawPayload> {
        let now = Utc::now();

        if let Some(entry) = self.lookup(key).await {
            if entry.is_fresh(now) {
                debug!("cache hit for {}", key);
                return Some(entry.payload);
            }
            debug!("cache entry for {} expired, evicting", key);
            self.entries.write().await.remove(key);
            return None;
        }
        None
    }

    /// Look up an entry regardless of TTL. Used when the quota forbids a
    /// refetch and stale data beats no data.
    pub async fn get_stale(&self, key: &str) -> Option<RawPayload> {
        self.lookup(key).await.map(|e| e.payload)
    }

    /// Store a payload under `key` with the given TTL, write-through to disk.
    pub async fn put(&self, key: &str, payload: RawPayload, ttl_secs: u64) -> Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            created_at: Utc::now(),
            ttl_secs,
        };

        let content = serde_json::to_string(&entry)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), entry);

        let path = self.entry_path(key);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to persist cache entry {}", path.display()))?;
        Ok(())
    }

    /// Drop an entry from memory and disk.
    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
        let path = self.entry_path(key);
        if path.exists() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("failed to remove cache file {}: {}", path.display(), e);
            }
        }
    }

    /// Memory first, then lazy load from disk.
    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.entries.read().await.get(key) {
            return Some(entry.clone());
        }

        let path = self.entry_path(key);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<CacheEntry>(&content) {
            // Sanitized filenames can collide across distinct keys; the
            // stored key decides whether this file belongs to the request.
            Ok(entry) if entry.key != key => {
                warn!(
                    "cache file {} holds key {:?}, not {:?}; miss",
                    path.display(),
                    entry.key,
                    key
                );
                None
            }
            Ok(entry) => {
                self.entries
                    .write()
                    .await
                    .insert(key.to_string(), entry.clone());
                Some(entry)
            }
            Err(e) => {
                warn!("discarding unreadable cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PayloadBody, SourceKind};

    fn sample_payload() -> RawPayload {
        RawPayload::fetched(
            SourceKind::Api,
            "site-energy",
            PayloadBody::Json(serde_json::json!({"energy": 42.0})),
        )
    }

    #[tokio::test]
    async fn test_put_then_get_within_ttl_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();

        cache
            .put("api:site-energy:month=2024-05", sample_payload(), 3600)
            .await
            .unwrap();

        let hit = cache.get("api:site-energy:month=2024-05").await;
        assert!(hit.is_some());
        assert!(matches!(hit.unwrap().body, Some(PayloadBody::Json(_))));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_but_stale_readable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();

        cache.put("k", sample_payload(), 0).await.unwrap();

        assert!(cache.get("k").await.is_none());
        // Evicted from memory, but the stale value is still reachable.
        assert!(cache.get_stale("k").await.is_some());
    }

    #[tokio::test]
    async fn test_entries_survive_restart_via_lazy_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheStore::open(dir.path()).unwrap();
            cache.put("persist-me", sample_payload(), 3600).await.unwrap();
        }

        let reopened = CacheStore::open(dir.path()).unwrap();
        assert!(reopened.get("persist-me").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();

        cache.put("gone", sample_payload(), 3600).await.unwrap();
        cache.invalidate("gone").await;

        assert!(cache.get("gone").await.is_none());
        assert!(cache.get_stale("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_keys_with_separators_map_to_safe_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();

        cache
            .put("api:e1:month=2024-05", sample_payload(), 3600)
            .await
            .unwrap();
        cache
            .put("api:e1:month=2024-06", sample_payload(), 3600)
            .await
            .unwrap();

        assert!(cache.get("api:e1:month=2024-05").await.is_some());
        assert!(cache.get("api:e1:month=2024-06").await.is_some());
    }

    #[tokio::test]
    async fn test_colliding_sanitized_keys_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheStore::open(dir.path()).unwrap();
            // "a:b" and "a_b" sanitize to the same filename.
            cache.put("a:b", sample_payload(), 3600).await.unwrap();
        }

        // A fresh store must not serve "a:b"'s file for "a_b".
        let reopened = CacheStore::open(dir.path()).unwrap();
        assert!(reopened.get("a_b").await.is_none());
        assert!(reopened.get("a:b").await.is_some());
    }
}
