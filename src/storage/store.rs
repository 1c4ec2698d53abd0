use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::atomic::{self, StagedFile};
use super::{decode_stem, domain_stem};
use crate::error::{SyncError, SyncResult};

const RECORD_EXT: &str = ".json";

/// The committed state blob for one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub domain: String,
    /// Opaque to the store, handed back unchanged
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(domain: impl Into<String>, payload: Value) -> Self {
        Self {
            domain: domain.into(),
            payload,
            updated_at: Utc::now(),
        }
    }
}

/// Durable map from domain name to its latest [`StateRecord`]
///
/// One file per domain under the data directory. Writes go through a temp file
/// and an atomic rename, so a crash leaves the previous record in place. Writes
/// to the same domain are last-install-wins; writes to different domains never
/// share a lock.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    // Committed records seen so far; only updated after a successful install
    committed: DashMap<String, Arc<StateRecord>>,
    // Serialises install+cache update per domain so memory and disk agree
    install_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StateStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SyncError::durability("*", e))?;

        let swept = atomic::sweep_temp_files(&dir).map_err(|e| SyncError::durability("*", e))?;
        if swept > 0 {
            warn!(swept, dir = %dir.display(), "Removed temp files from interrupted writes");
        }
        info!(dir = %dir.display(), "State store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                committed: DashMap::new(),
                install_locks: DashMap::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Persist `payload` as the new record for `domain`
    ///
    /// On error nothing observable changes: the previous record stays on disk
    /// and in memory.
    pub async fn write(&self, domain: &str, payload: Value) -> SyncResult<Arc<StateRecord>> {
        let store = self.clone();
        let domain = domain.to_string();

        tokio::task::spawn_blocking(move || store.stage(&domain, payload)?.install())
            .await
            .map_err(|err| SyncError::durability("*", std::io::Error::other(err)))?
    }

    /// Latest committed record for `domain`, or `None` if it was never written
    pub async fn read(&self, domain: &str) -> SyncResult<Option<Arc<StateRecord>>> {
        if let Some(record) = self.inner.committed.get(domain) {
            return Ok(Some(record.clone()));
        }

        let store = self.clone();
        let domain = domain.to_string();
        tokio::task::spawn_blocking(move || store.load(&domain))
            .await
            .map_err(|err| SyncError::durability("*", std::io::Error::other(err)))?
    }

    /// Write the record to a temp file without making it visible
    pub fn stage(&self, domain: &str, payload: Value) -> SyncResult<StagedWrite> {
        let record = StateRecord::new(domain, payload);
        let bytes = serde_json::to_vec_pretty(&record)?;
        let file = StagedFile::stage(&self.record_path(domain), &bytes)
            .map_err(|e| SyncError::durability(domain, e))?;

        Ok(StagedWrite {
            store: self.clone(),
            record,
            file,
        })
    }

    /// Domains that have a committed record on disk, sorted
    pub async fn domains(&self) -> SyncResult<Vec<String>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_domains())
            .await
            .map_err(|err| SyncError::durability("*", std::io::Error::other(err)))?
    }

    fn list_domains(&self) -> SyncResult<Vec<String>> {
        let entries =
            std::fs::read_dir(&self.inner.dir).map_err(|e| SyncError::durability("*", e))?;

        let mut domains = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::durability("*", e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if atomic::is_temp_name(&name) {
                continue;
            }
            let Some(stem) = name.strip_suffix(RECORD_EXT) else {
                continue;
            };
            match decode_stem(stem) {
                Some(domain) => domains.push(domain),
                // Digest names only live in the record itself
                None => match read_record(&entry.path()) {
                    Ok(record) => domains.push(record.domain),
                    Err(err) => warn!(file = %name, "Skipping unreadable record: {err}"),
                },
            }
        }
        domains.sort();
        Ok(domains)
    }

    fn load(&self, domain: &str) -> SyncResult<Option<Arc<StateRecord>>> {
        // Absent domains never get an install lock entry
        let bytes = match std::fs::read(self.record_path(domain)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SyncError::durability(domain, err)),
        };
        let record: StateRecord = serde_json::from_slice(&bytes)?;

        let lock = self.install_lock(domain);
        let _guard = lock.lock();

        // A writer may have installed while we were reading
        if let Some(current) = self.inner.committed.get(domain) {
            return Ok(Some(current.clone()));
        }

        let record = Arc::new(record);
        self.inner
            .committed
            .insert(domain.to_string(), record.clone());
        debug!(domain, "Loaded state record from disk");

        Ok(Some(record))
    }

    fn install_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.inner
            .install_locks
            .entry(domain.to_string())
            .or_default()
            .clone()
    }

    fn record_path(&self, domain: &str) -> PathBuf {
        self.inner
            .dir
            .join(format!("{}{RECORD_EXT}", domain_stem(domain)))
    }
}

fn read_record(path: &Path) -> SyncResult<StateRecord> {
    let bytes = std::fs::read(path).map_err(|e| SyncError::durability("*", e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// A record written to a temp file, waiting for [`StagedWrite::install`]
///
/// Dropping it without installing discards the temp file and leaves the
/// committed record untouched.
pub struct StagedWrite {
    store: StateStore,
    record: StateRecord,
    file: StagedFile,
}

impl StagedWrite {
    pub fn record(&self) -> &StateRecord {
        &self.record
    }

    /// Rename the temp file over the domain's record and publish it in memory
    pub fn install(self) -> SyncResult<Arc<StateRecord>> {
        let Self {
            store,
            record,
            file,
        } = self;

        let lock = store.install_lock(&record.domain);
        let _guard = lock.lock();

        file.install()
            .map_err(|e| SyncError::durability(&record.domain, e))?;

        let record = Arc::new(record);
        store
            .inner
            .committed
            .insert(record.domain.clone(), record.clone());
        debug!(domain = %record.domain, "Committed state record");

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("data")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_then_read_returns_payload() {
        let (_dir, store) = store();
        let payload = json!({"level": 0.5, "minions": [{"id": 1, "name": "bob"}]});

        store.write("quantum", payload.clone()).await.unwrap();
        let record = store.read("quantum").await.unwrap().unwrap();

        assert_eq!(record.payload, payload);
        assert_eq!(record.domain, "quantum");
    }

    #[tokio::test]
    async fn test_read_missing_domain_is_absent() {
        let (_dir, store) = store();
        assert!(store.read("civilization").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (_dir, store) = store();
        store.write("quantum", json!({"v": 1})).await.unwrap();
        store.write("quantum", json!({"v": 2})).await.unwrap();

        let record = store.read("quantum").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"v": 2}));
        assert_eq!(store.domains().await.unwrap(), vec!["quantum".to_string()]);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let (dir, store) = store();
        store.write("knowledge", json!(["a", "b"])).await.unwrap();
        drop(store);

        let reopened = StateStore::open(dir.path().join("data")).unwrap();
        let record = reopened.read("knowledge").await.unwrap().unwrap();
        assert_eq!(record.payload, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_crash_between_stage_and_install_keeps_previous() {
        let (dir, store) = store();
        store.write("quantum", json!({"level": 0.1})).await.unwrap();

        let staged = store.stage("quantum", json!({"level": 0.9})).unwrap();
        // Simulate the process dying before the rename: the temp file stays.
        std::mem::forget(staged);

        assert_eq!(
            store.read("quantum").await.unwrap().unwrap().payload,
            json!({"level": 0.1})
        );

        let reopened = StateStore::open(dir.path().join("data")).unwrap();
        assert_eq!(
            reopened.read("quantum").await.unwrap().unwrap().payload,
            json!({"level": 0.1})
        );
        let leftovers = std::fs::read_dir(reopened.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_committed_record() {
        let (_dir, store) = store();
        store.write("minions", json!({"count": 3})).await.unwrap();

        std::fs::remove_dir_all(store.dir()).unwrap();
        let err = store.write("minions", json!({"count": 4})).await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Durability);

        let record = store.read("minions").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_domain_names_stay_inside_data_dir() {
        let (dir, store) = store();
        store.write("../escape", json!(1)).await.unwrap();
        store.write("a b/c", json!(2)).await.unwrap();

        assert!(!dir.path().join("escape.json").exists());
        assert_eq!(
            store.domains().await.unwrap(),
            vec!["../escape".to_string(), "a b/c".to_string()]
        );

        let reopened = StateStore::open(store.dir()).unwrap();
        assert_eq!(
            reopened.read("a b/c").await.unwrap().unwrap().payload,
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_long_multibyte_domain_round_trips() {
        let (_dir, store) = store();
        let domain = "量".repeat(42);
        assert_eq!(domain.len(), 126);

        assert!(store.read(&domain).await.unwrap().is_none());
        store.write(&domain, json!({"level": 0.5})).await.unwrap();
        store.write("quantum", json!(1)).await.unwrap();

        let reopened = StateStore::open(store.dir()).unwrap();
        let record = reopened.read(&domain).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"level": 0.5}));

        let mut expected = vec![domain, "quantum".to_string()];
        expected.sort();
        assert_eq!(reopened.domains().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_absent_reads_leave_no_lock_entries() {
        let (_dir, store) = store();
        for i in 0..100 {
            assert!(store.read(&format!("never-{i}")).await.unwrap().is_none());
        }
        assert!(store.inner.install_locks.is_empty());

        store.write("quantum", json!(1)).await.unwrap();
        let reopened = StateStore::open(store.dir()).unwrap();
        reopened.read("quantum").await.unwrap().unwrap();
        assert_eq!(reopened.inner.install_locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_same_domain_settle_on_one() {
        let (_dir, store) = store();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("quantum", json!({ "writer": i })).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let in_memory = store.read("quantum").await.unwrap().unwrap();
        let on_disk = StateStore::open(store.dir())
            .unwrap()
            .read("quantum")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_memory.payload, on_disk.payload);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_different_domains() {
        let (_dir, store) = store();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write(&format!("domain-{i}"), json!(i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.domains().await.unwrap().len(), 8);
        for i in 0..8 {
            let record = store.read(&format!("domain-{i}")).await.unwrap().unwrap();
            assert_eq!(record.payload, json!(i));
        }
    }
}
