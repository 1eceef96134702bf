//! # Disk + memory cache store
//!
//! Reads check the memory tier first and fall back to disk, promoting hits.
//! Writes update memory immediately and persist to disk in the background.
//!
//! Every disk write or delete holds the write side of a per-store barrier and
//! every disk read holds the read side, so reads overlap each other but never
//! observe a half-applied write or delete. The index is only ever mutated inside
//! short [`GuardedState`] closures; all file I/O runs on the blocking pool.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::index::{CacheEntry, CacheIndex, INDEX_FILE_NAME, write_atomic};
use super::key::CacheKey;
use super::memory::{CostFn, MemoryTier};
use crate::config::PixcacheConfig;
use crate::error::{FetchError, Result};
use crate::sync::GuardedState;

/// Settings for [`DiskMemCacheStore::open`].
#[derive(Clone)]
pub struct StoreOptions {
    pub root: PathBuf,
    pub max_age: Duration,
    pub max_size: u64,
    pub memory_count_limit: usize,
    pub memory_cost_limit: u64,
    pub cost_fn: CostFn<Bytes>,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from(&PixcacheConfig {
            cache_dir: root.into(),
            ..Default::default()
        })
    }

    pub fn with_cost_fn(mut self, cost_fn: CostFn<Bytes>) -> Self {
        self.cost_fn = cost_fn;
        self
    }
}

impl From<&PixcacheConfig> for StoreOptions {
    fn from(config: &PixcacheConfig) -> Self {
        Self {
            root: config.cache_dir.clone(),
            max_age: config.max_cache_age,
            max_size: config.max_cache_size,
            memory_count_limit: config.memory_count_limit,
            memory_cost_limit: config.memory_cost_limit,
            cost_fn: Arc::new(|data: &Bytes| data.len() as u64),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Removed by the age phase
    pub expired: Vec<CacheKey>,
    /// Removed by the size phase
    pub evicted: Vec<CacheKey>,
    pub reclaimed_bytes: u64,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.evicted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removed() == 0
    }
}

/// A background disk mutation. Dropping it does not cancel the work.
#[must_use = "dropping a PendingWrite detaches it; call wait() to observe the outcome"]
#[derive(Debug)]
pub struct PendingWrite {
    handle: Option<JoinHandle<Result<()>>>,
}

impl PendingWrite {
    fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(task)),
        }
    }

    fn done() -> Self {
        Self { handle: None }
    }

    /// Wait until the mutation has reached disk (or failed).
    pub async fn wait(self) -> Result<()> {
        match self.handle {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

struct IndexState {
    index: CacheIndex,
    generation: u64,
    /// Keys dropped from the index whose files are not deleted yet, with the
    /// number of deletions still pending for each.
    deleting: HashMap<CacheKey, usize>,
}

/// Serialized index tagged with the generation it was taken at.
struct IndexSnapshot {
    generation: u64,
    bytes: Vec<u8>,
}

impl IndexState {
    fn mark_deleting<'a>(&mut self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        for key in keys {
            *self.deleting.entry(key.clone()).or_default() += 1;
        }
    }

    fn settle_deleting(&mut self, keys: &[CacheKey]) {
        for key in keys {
            if let Some(pending) = self.deleting.get_mut(key) {
                *pending -= 1;
                if *pending == 0 {
                    self.deleting.remove(key);
                }
            }
        }
    }

    /// Removed from the index and waiting for its file to go.
    fn is_deleting(&self, key: &CacheKey) -> bool {
        self.deleting.contains_key(key) && !self.index.contains(key)
    }

    fn bump(&mut self) -> Result<IndexSnapshot> {
        self.generation += 1;
        Ok(IndexSnapshot {
            generation: self.generation,
            bytes: self.index.to_json()?,
        })
    }
}

struct StoreInner {
    root: PathBuf,
    index_path: PathBuf,
    index: GuardedState<IndexState>,
    memory: MemoryTier<CacheKey, Bytes>,
    barrier: RwLock<()>,
    /// Highest index generation written to disk.
    persisted: Mutex<u64>,
    /// Disk mutations spawned and not yet finished.
    in_flight: AtomicUsize,
    idle: Notify,
    max_age: Duration,
    max_size: u64,
}

/// Decrements the in-flight count even when the task is aborted.
struct InFlight(Arc<StoreInner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Two-tier fetch-through cache storage.
#[derive(Clone)]
pub struct DiskMemCacheStore {
    inner: Arc<StoreInner>,
}

impl DiskMemCacheStore {
    /// Open (or create) the cache at `options.root`.
    ///
    /// Loads the index, drops entries whose file has gone missing and runs the
    /// startup sweep before returning.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&options.root).await?;

        let root = options.root.clone();
        let index_path = root.join(INDEX_FILE_NAME);
        let (index, dirty) = {
            let root = root.clone();
            let index_path = index_path.clone();
            tokio::task::spawn_blocking(move || {
                let (mut index, corrupt) = CacheIndex::load(&index_path);
                let missing = index.retain_existing(&root);
                if !missing.is_empty() {
                    info!(count = missing.len(), "Dropped index entries without a backing file");
                }
                (index, corrupt || !missing.is_empty())
            })
            .await?
        };

        debug!(
            root = %root.display(),
            entries = index.len(),
            size = index.total_size(),
            "Opened cache store"
        );

        let memory = MemoryTier::new(
            options.memory_count_limit,
            options.memory_cost_limit,
            options.cost_fn,
        );

        let store = Self {
            inner: Arc::new(StoreInner {
                root,
                index_path,
                index: GuardedState::new(IndexState {
                    index,
                    generation: 0,
                    deleting: HashMap::new(),
                }),
                memory,
                barrier: RwLock::new(()),
                persisted: Mutex::new(0),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                max_age: options.max_age,
                max_size: options.max_size,
            }),
        };

        if dirty {
            let snapshot = store.inner.index.write(IndexState::bump)?;
            store.inner.persist(snapshot).await?;
        }

        let (report, pending) = store.sweep();
        if !report.is_empty() {
            info!(
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                reclaimed_bytes = report.reclaimed_bytes,
                "Startup sweep"
            );
        }
        if let Err(e) = pending.wait().await {
            warn!(error = %e, "Startup sweep did not complete");
        }

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Look up `key`, memory first, then disk.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        if let Some(data) = self.inner.memory.get(key) {
            debug!(%key, "Memory cache hit");
            return Some(data);
        }

        let path = self.inner.path_for(key);
        let (data, snapshot) = {
            let _read = self.inner.barrier.read().await;

            let read = tokio::task::spawn_blocking(move || read_with_mtime(&path)).await;
            let (data, modified) = match read {
                Ok(Ok(found)) => found,
                Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(%key, "Cache miss");
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(%key, error = %e, "Failed to read cached file");
                    return None;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Cache read task failed");
                    return None;
                }
            };

            let now = Utc::now();
            let size = data.len() as u64;
            let snapshot = self.inner.index.write(|state| {
                if state.is_deleting(key) {
                    return None;
                }
                if !state.index.touch(key, now) {
                    debug!(%key, "Backfilling index entry for untracked file");
                    state.index.upsert(
                        key.clone(),
                        CacheEntry {
                            size: Some(size),
                            last_modified: Some(modified.map(DateTime::<Utc>::from).unwrap_or(now)),
                            last_visited: Some(now),
                        },
                    );
                }
                Some(state.bump())
            });
            let Some(snapshot) = snapshot else {
                debug!(%key, "Cache miss, file is pending deletion");
                return None;
            };
            (data, snapshot)
        };

        debug!(%key, size = data.len(), "Disk cache hit");
        self.inner.memory.insert(key.clone(), data.clone());

        let persisted = match snapshot {
            Ok(snapshot) => self.inner.persist(snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            warn!(%key, error = %e, "Failed to persist cache index");
        }

        Some(data)
    }

    /// Store `data` under `key`: memory now, disk in the background.
    pub fn put(&self, key: CacheKey, data: Bytes) -> PendingWrite {
        self.inner.memory.insert(key.clone(), data.clone());
        let inner = Arc::clone(&self.inner);
        self.inner.track(async move {
            let result = inner.write_entry(&key, data).await;
            if let Err(e) = &result {
                warn!(%key, error = %e, "Failed to write cache entry");
            }
            result
        })
    }

    /// Invalidate `key` in both tiers.
    pub fn remove(&self, key: &CacheKey) -> PendingWrite {
        self.inner.memory.remove(key);
        let snapshot = self.inner.index.write(|state| {
            state.index.remove(key);
            state.mark_deleting([key]);
            state.bump()
        });
        self.inner.spawn_delete(vec![key.clone()], Some(snapshot))
    }

    /// Drop every tracked entry in both tiers.
    pub fn clear(&self) -> PendingWrite {
        self.inner.memory.clear();
        let (keys, snapshot) = self.inner.index.write(|state| {
            let keys = state.index.take_all();
            state.mark_deleting(&keys);
            (keys, state.bump())
        });
        info!(count = keys.len(), "Clearing cache");
        self.inner.spawn_delete(keys, Some(snapshot))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.memory.contains(key) || self.inner.index.read(|state| state.index.contains(key))
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner
            .index
            .read(|state| state.index.get(key).cloned())
    }

    /// Total tracked disk size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.index.read(|state| state.index.total_size())
    }

    pub fn entry_count(&self) -> usize {
        self.inner.index.read(|state| state.index.len())
    }

    pub fn memory_len(&self) -> usize {
        self.inner.memory.len()
    }

    /// Wait until every disk write and deletion started so far has finished,
    /// including detached ones.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn sweep(&self) -> (SweepReport, PendingWrite) {
        self.sweep_at(Utc::now())
    }

    /// Age phase, then size phase, as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> (SweepReport, PendingWrite) {
        let inner = &self.inner;
        let cutoff = TimeDelta::from_std(inner.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));

        let (report, snapshot) = inner.index.write(|state| {
            let mut report = SweepReport::default();

            if let Some(cutoff) = cutoff {
                report.expired = state.index.select_expired(cutoff);
                for key in &report.expired {
                    if let Some(entry) = state.index.remove(key) {
                        report.reclaimed_bytes += entry.size_or_zero();
                    }
                }
            }

            if state.index.total_size() > inner.max_size {
                report.evicted = state.index.select_least_recent(inner.max_size / 2);
                for key in &report.evicted {
                    if let Some(entry) = state.index.remove(key) {
                        report.reclaimed_bytes += entry.size_or_zero();
                    }
                }
            }

            state.mark_deleting(report.expired.iter().chain(report.evicted.iter()));
            let snapshot = (!report.is_empty()).then(|| state.bump());
            (report, snapshot)
        });

        if report.is_empty() {
            return (report, PendingWrite::done());
        }

        info!(
            expired = report.expired.len(),
            evicted = report.evicted.len(),
            reclaimed_bytes = report.reclaimed_bytes,
            "Swept cache"
        );

        let keys: Vec<CacheKey> = report
            .expired
            .iter()
            .chain(report.evicted.iter())
            .cloned()
            .collect();
        for key in &keys {
            inner.memory.remove(key);
        }
        let pending = inner.spawn_delete(keys, snapshot);
        (report, pending)
    }

    /// Sweep every `interval` until the store is dropped.
    pub fn start_maintenance_task(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Cache store dropped, stopping maintenance");
                    break;
                };
                let store = DiskMemCacheStore { inner };
                let (_, pending) = store.sweep();
                if let Err(e) = pending.wait().await {
                    warn!(error = %e, "Periodic sweep failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for DiskMemCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskMemCacheStore")
            .field("root", &self.inner.root)
            .field("entries", &self.entry_count())
            .field("size", &self.size())
            .field("memory", &self.inner.memory)
            .finish()
    }
}

impl StoreInner {
    fn track<F>(self: &Arc<Self>, task: F) -> PendingWrite
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(Arc::clone(self));
        PendingWrite::spawn(async move {
            let _guard = guard;
            task.await
        })
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_filename())
    }

    async fn write_entry(self: &Arc<Self>, key: &CacheKey, data: Bytes) -> Result<()> {
        let path = self.path_for(key);
        let size = data.len() as u64;
        let _write = self.barrier.write().await;

        tokio::task::spawn_blocking(move || write_atomic(&path, &data)).await??;

        let now = Utc::now();
        let (previous, snapshot) = self.index.write(|state| {
            let previous = state.index.upsert(key.clone(), CacheEntry::new(size, now));
            (previous, state.bump())
        });

        let persisted = match snapshot {
            Ok(snapshot) => self.persist(snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            warn!(%key, error = %e, "Index flush failed, rolling back entry");
            let snapshot = self.index.write(|state| {
                match previous {
                    Some(previous) => {
                        state.index.upsert(key.clone(), previous);
                    }
                    None => {
                        state.index.remove(key);
                    }
                }
                state.bump()
            });
            let rolled_back = match snapshot {
                Ok(snapshot) => self.persist(snapshot).await,
                Err(err) => Err(err),
            };
            if let Err(rollback) = rolled_back {
                warn!(%key, error = %rollback, "Failed to persist index rollback");
            }
            return Err(e);
        }

        debug!(%key, size, "Stored cache entry");
        Ok(())
    }

    /// Write `snapshot` unless a newer generation already reached disk.
    async fn persist(self: &Arc<Self>, snapshot: IndexSnapshot) -> Result<()> {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut persisted = inner.persisted.lock();
            if snapshot.generation <= *persisted {
                return Ok(());
            }
            write_atomic(&inner.index_path, &snapshot.bytes)?;
            *persisted = snapshot.generation;
            Ok(())
        })
        .await?
    }

    /// Flush the index, then delete the files of `keys` that have not been
    /// re-inserted in the meantime.
    fn spawn_delete(
        self: &Arc<Self>,
        keys: Vec<CacheKey>,
        snapshot: Option<Result<IndexSnapshot>>,
    ) -> PendingWrite {
        let inner = Arc::clone(self);
        self.track(async move {
            let _write = inner.barrier.write().await;
            let result = inner.delete_files(&keys, snapshot).await;
            inner.index.write(|state| state.settle_deleting(&keys));
            result
        })
    }

    async fn delete_files(
        self: &Arc<Self>,
        keys: &[CacheKey],
        snapshot: Option<Result<IndexSnapshot>>,
    ) -> Result<()> {
        if let Some(snapshot) = snapshot {
            self.persist(snapshot?).await?;
        }

        let doomed: Vec<PathBuf> = self.index.read(|state| {
            keys.iter()
                .filter(|key| !state.index.contains(key))
                .map(|key| self.path_for(key))
                .collect()
        });

        tokio::task::spawn_blocking(move || -> Result<()> {
            for path in doomed {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete cached file");
                        return Err(FetchError::from(e));
                    }
                }
            }
            Ok(())
        })
        .await?
    }
}

fn read_with_mtime(path: &Path) -> io::Result<(Bytes, Option<SystemTime>)> {
    let data = fs::read(path)?;
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok((Bytes::from(data), modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn options(root: &Path) -> StoreOptions {
        StoreOptions {
            root: root.to_path_buf(),
            max_age: Duration::from_secs(60 * 24 * 60 * 60),
            max_size: 1000,
            memory_count_limit: 100,
            memory_cost_limit: 1 << 20,
            cost_fn: Arc::new(|b: &Bytes| b.len() as u64),
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_url(&format!("https://example.com/{name}"))
    }

    #[tokio::test]
    async fn test_put_then_get_from_memory_and_disk() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let k = key("a.png");

        store.put(k.clone(), Bytes::from_static(b"abc")).wait().await.unwrap();
        assert_eq!(store.get(&k).await, Some(Bytes::from_static(b"abc")));
        assert_eq!(store.size(), 3);
        assert!(dir.path().join(k.to_filename()).is_file());
        assert!(dir.path().join(INDEX_FILE_NAME).is_file());

        // a fresh store only has the disk tier
        drop(store);
        let reopened = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        assert_eq!(reopened.memory_len(), 0);
        assert_eq!(reopened.get(&k).await, Some(Bytes::from_static(b"abc")));
        assert_eq!(reopened.memory_len(), 1);
        assert_eq!(reopened.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_disk_hit_updates_visit_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let k = key("a.png");
        store.put(k.clone(), Bytes::from_static(b"abc")).wait().await.unwrap();
        let written = store.entry(&k).unwrap().last_visited.unwrap();

        // evict from memory only
        store.inner.memory.remove(&k);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get(&k).await.is_some());

        let visited = store.entry(&k).unwrap().last_visited.unwrap();
        assert!(visited > written);
    }

    #[tokio::test]
    async fn test_flush_waits_for_detached_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        for name in ["a", "b", "c"] {
            let _ = store.put(key(name), Bytes::from_static(b"xyz"));
        }
        store.flush().await;

        assert_eq!(store.entry_count(), 3);
        assert_eq!(store.inner.in_flight.load(Ordering::Acquire), 0);
        let index = fs::read_to_string(dir.path().join(INDEX_FILE_NAME)).unwrap();
        assert!(index.contains(key("c").as_str()));
    }

    #[tokio::test]
    async fn test_missing_key_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        assert!(store.get(&key("nope")).await.is_none());
        assert!(!store.contains(&key("nope")));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_index_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let k = key("blocked.png");
        // a directory where the file should go makes the rename fail
        fs::create_dir(dir.path().join(k.to_filename())).unwrap();
        fs::write(dir.path().join(k.to_filename()).join("x"), b"x").unwrap();

        let result = store.put(k.clone(), Bytes::from_static(b"data")).wait().await;
        assert!(matches!(result, Err(FetchError::Filesystem { .. })));
        assert!(store.entry(&k).is_none());
        assert_eq!(store.size(), 0);
        // the memory tier was still updated
        assert_eq!(store.get(&k).await, Some(Bytes::from_static(b"data")));
    }

    #[tokio::test]
    async fn test_age_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let old = key("old");
        let fresh = key("fresh");
        store.put(old.clone(), Bytes::from_static(b"1234")).wait().await.unwrap();
        store.put(fresh.clone(), Bytes::from_static(b"12")).wait().await.unwrap();

        let now = Utc::now();
        store.inner.index.write(|state| {
            state.index.upsert(
                old.clone(),
                CacheEntry::new(4, now - TimeDelta::days(61)),
            );
        });

        let (report, pending) = store.sweep_at(now);
        pending.wait().await.unwrap();

        assert_eq!(report.expired, vec![old.clone()]);
        assert!(report.evicted.is_empty());
        assert_eq!(report.reclaimed_bytes, 4);
        assert!(!dir.path().join(old.to_filename()).exists());
        assert!(dir.path().join(fresh.to_filename()).exists());
        assert!(store.get(&old).await.is_none());
        assert_eq!(store.size(), 2);
    }

    #[tokio::test]
    async fn test_size_sweep_reaches_half_of_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let base = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        for i in 0..6u32 {
            let k = key(&format!("{i}.png"));
            store.put(k.clone(), Bytes::from(vec![0u8; 200])).wait().await.unwrap();
            // visit order = insertion order
            store.inner.index.write(|state| {
                state.index.upsert(
                    k,
                    CacheEntry {
                        size: Some(200),
                        last_modified: Some(base),
                        last_visited: Some(base + TimeDelta::minutes(i64::from(i))),
                    },
                );
            });
        }
        assert_eq!(store.size(), 1200);

        let (report, pending) = store.sweep_at(base + TimeDelta::days(1));
        pending.wait().await.unwrap();

        // 1200 > 1000, target 500: drop the four least recently visited
        let expected: Vec<CacheKey> = (0..4).map(|i| key(&format!("{i}.png"))).collect();
        assert_eq!(report.evicted, expected);
        assert_eq!(store.size(), 400);
        assert!(store.size() <= 500);
        for k in &expected {
            assert!(!dir.path().join(k.to_filename()).exists());
        }
    }

    #[tokio::test]
    async fn test_unwritable_index_rolls_back_entry() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        // a non-empty directory in place of the index makes every flush fail,
        // the rollback flush included
        let index_path = dir.path().join(INDEX_FILE_NAME);
        fs::create_dir(&index_path).unwrap();
        fs::write(index_path.join("x"), b"x").unwrap();

        let k = key("a.png");
        let result = store.put(k.clone(), Bytes::from_static(b"data")).wait().await;
        assert!(matches!(result, Err(FetchError::Filesystem { .. })));
        assert!(store.entry(&k).is_none());
        assert_eq!(store.size(), 0);
    }

    #[tokio::test]
    async fn test_age_sweep_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let max_age = TimeDelta::days(60);
        let stale = key("stale");
        let fresh = key("fresh");
        store.put(stale.clone(), Bytes::from_static(b"1234")).wait().await.unwrap();
        store.put(fresh.clone(), Bytes::from_static(b"1234")).wait().await.unwrap();

        let now = Utc::now();
        store.inner.index.write(|state| {
            state.index.upsert(
                stale.clone(),
                CacheEntry::new(4, now - max_age - TimeDelta::seconds(1)),
            );
            state.index.upsert(
                fresh.clone(),
                CacheEntry::new(4, now - max_age + TimeDelta::seconds(1)),
            );
        });

        let (report, pending) = store.sweep_at(now);
        pending.wait().await.unwrap();

        assert_eq!(report.expired, vec![stale.clone()]);
        assert!(report.evicted.is_empty());
        assert!(!dir.path().join(stale.to_filename()).exists());
        assert!(store.entry(&fresh).is_some());
        assert!(dir.path().join(fresh.to_filename()).is_file());
    }

    #[tokio::test]
    async fn test_size_sweep_keeps_small_recent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let base = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        // (name, size, minutes after base of the last visit)
        let layout = [("big-old", 400, 0), ("big-older", 400, 1), ("mid", 200, 5), ("small", 50, 10)];
        for (name, size, visited) in layout {
            let k = key(name);
            store.put(k.clone(), Bytes::from(vec![0u8; size])).wait().await.unwrap();
            store.inner.index.write(|state| {
                state.index.upsert(
                    k,
                    CacheEntry {
                        size: Some(size as u64),
                        last_modified: Some(base),
                        last_visited: Some(base + TimeDelta::minutes(visited)),
                    },
                );
            });
        }
        assert_eq!(store.size(), 1050);

        let (report, pending) = store.sweep_at(base + TimeDelta::days(1));
        pending.wait().await.unwrap();

        assert_eq!(report.evicted, vec![key("big-old"), key("big-older")]);
        assert_eq!(report.reclaimed_bytes, 800);
        assert_eq!(store.size(), 250);
        assert!(store.entry(&key("small")).is_some());
        assert!(store.entry(&key("mid")).is_some());
        assert!(dir.path().join(key("small").to_filename()).is_file());
    }

    #[tokio::test]
    async fn test_get_racing_remove_does_not_restore_entry() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let k = key("a.png");
        store.put(k.clone(), Bytes::from_static(b"v1")).wait().await.unwrap();

        let removal = store.remove(&k);
        assert_eq!(store.get(&k).await, None);
        removal.wait().await.unwrap();

        assert!(!store.contains(&k));
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.memory_len(), 0);
        assert!(!dir.path().join(k.to_filename()).exists());
        assert!(store.inner.index.read(|state| state.deleting.is_empty()));
    }

    #[tokio::test]
    async fn test_get_racing_sweep_does_not_restore_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        for i in 0..6u32 {
            let k = key(&format!("{i}.png"));
            store.put(k, Bytes::from(vec![0u8; 200])).wait().await.unwrap();
        }

        let (report, pending) = store.sweep();
        assert_eq!(report.evicted.len(), 4);
        for k in &report.evicted {
            assert!(store.get(k).await.is_none());
        }
        pending.wait().await.unwrap();

        assert_eq!(store.size(), 400);
        assert_eq!(store.entry_count(), 2);
        for k in &report.evicted {
            assert!(!store.contains(k));
            assert!(!dir.path().join(k.to_filename()).exists());
        }
    }

    #[tokio::test]
    async fn test_reinserted_key_survives_pending_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        let k = key("a.png");
        store.put(k.clone(), Bytes::from_static(b"v1")).wait().await.unwrap();

        // hold the barrier so the key is back in the index before the delete runs
        let hold = store.inner.barrier.write().await;
        let removal = store.remove(&k);
        store.inner.index.write(|state| {
            state.index.upsert(k.clone(), CacheEntry::new(2, Utc::now()));
        });
        drop(hold);

        removal.wait().await.unwrap();
        assert!(dir.path().join(k.to_filename()).is_file());
        assert_eq!(store.get(&k).await, Some(Bytes::from_static(b"v1")));
    }

    #[tokio::test]
    async fn test_open_recovers_from_corrupt_index_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
            store.put(key("a"), Bytes::from_static(b"aa")).wait().await.unwrap();
            store.put(key("b"), Bytes::from_static(b"bb")).wait().await.unwrap();
        }
        fs::remove_file(dir.path().join(key("b").to_filename())).unwrap();

        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        assert_eq!(store.entry_count(), 1);
        assert!(store.entry(&key("a")).is_some());
        drop(store);

        fs::write(dir.path().join(INDEX_FILE_NAME), b"garbage").unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        assert_eq!(store.entry_count(), 0);
        // the orphaned file is picked up again on read
        assert_eq!(store.get(&key("a")).await, Some(Bytes::from_static(b"aa")));
        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.size(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemCacheStore::open(options(dir.path())).await.unwrap();
        store.put(key("a"), Bytes::from_static(b"aa")).wait().await.unwrap();
        store.put(key("b"), Bytes::from_static(b"bb")).wait().await.unwrap();

        store.clear().wait().await.unwrap();
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.memory_len(), 0);
        assert!(store.get(&key("a")).await.is_none());
    }
}
