//! Local fallback cache
//!
//! Keeps the last known-good payload per domain on the client's own disk, so
//! a restarted client (or one whose server is down) still has something to
//! show. Entries are replaced atomically, same as server records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::storage::{domain_stem, write_atomic};

/// One cached payload, tagged with when it was cached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedState {
    pub domain: String,
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FallbackCache {
    dir: PathBuf,
}

impl FallbackCache {
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SyncError::durability("*", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn put(&self, domain: &str, payload: &Value) -> SyncResult<CachedState> {
        let entry = CachedState {
            domain: domain.to_string(),
            payload: payload.clone(),
            cached_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        let path = self.entry_path(domain);

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|err| SyncError::durability(domain, std::io::Error::other(err)))?
            .map_err(|e| SyncError::durability(domain, e))?;

        Ok(entry)
    }

    pub async fn get(&self, domain: &str) -> SyncResult<Option<CachedState>> {
        let bytes = match tokio::fs::read(self.entry_path(domain)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SyncError::durability(domain, err)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn entry_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.json", domain_stem(domain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cache_put_get() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::open(dir.path()).unwrap();

        assert!(cache.get("quantum").await.unwrap().is_none());

        let before = Utc::now();
        cache.put("quantum", &json!({"level": 0.5})).await.unwrap();
        cache.put("quantum", &json!({"level": 0.7})).await.unwrap();

        let entry = cache.get("quantum").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!({"level": 0.7}));
        assert!(entry.cached_at >= before);
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = TempDir::new().unwrap();
        FallbackCache::open(dir.path())
            .unwrap()
            .put("minions", &json!([1, 2, 3]))
            .await
            .unwrap();

        let reopened = FallbackCache::open(dir.path()).unwrap();
        let entry = reopened.get("minions").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_cache_long_multibyte_domain() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::open(dir.path()).unwrap();
        let domain = "量".repeat(42);

        assert!(cache.get(&domain).await.unwrap().is_none());
        cache.put(&domain, &json!({"level": 1})).await.unwrap();

        let entry = cache.get(&domain).await.unwrap().unwrap();
        assert_eq!(entry.domain, domain);
        assert_eq!(entry.payload, json!({"level": 1}));
    }
}
