use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task;
use tracing::{debug, info, warn};

use crate::models::{CacheEntry, CacheKey, Freshness, Record, RecordKind, TimeBucket};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Entry at {} could not be serialized: {source}", path.display())]
    Serialization {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Background cache task failed: {0}")]
    TaskJoin(#[from] task::JoinError),

    #[error("Cache store is closed")]
    Closed,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Bucketing and expiry rules of the store
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Granularity `observed_at` is truncated to when building keys
    pub bucket: Duration,
    /// How long an expired entry is still served as stale
    pub grace: Duration,
    pub weather_ttl: Duration,
    pub travel_ttl: Duration,
    /// Random spread applied to each TTL, as a fraction (0.1 = ±10%)
    pub ttl_jitter: f64,
    /// Per-source TTL overrides
    pub source_ttls: HashMap<String, Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(60 * 60),
            grace: Duration::from_secs(6 * 60 * 60),
            weather_ttl: Duration::from_secs(30 * 60),
            travel_ttl: Duration::from_secs(6 * 60 * 60),
            ttl_jitter: 0.0,
            source_ttls: HashMap::new(),
        }
    }
}

impl CacheSettings {
    /// TTL of a record: the source override if any, otherwise the kind default
    #[must_use]
    pub fn ttl_for(&self, record: &Record) -> Duration {
        if let Some(ttl) = self.source_ttls.get(&record.source_id) {
            return *ttl;
        }
        match record.kind {
            RecordKind::Weather => self.weather_ttl,
            RecordKind::Travel => self.travel_ttl,
        }
    }

    fn jittered(&self, ttl: Duration) -> Duration {
        if self.ttl_jitter <= 0.0 {
            return ttl;
        }
        let spread: f64 = rand::rng().random_range(-self.ttl_jitter..=self.ttl_jitter);
        ttl.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Durable `(subject, kind, bucket)` store backed by one JSON file per entry.
///
/// Files live under `<root>/<kind>/<url-encoded subject>/<bucket>.json` and
/// are replaced atomically. The in-memory index always reflects the last
/// fully written file. Writes to the same key are serialized.
pub struct CacheStore {
    root: PathBuf,
    settings: CacheSettings,
    index: RwLock<HashMap<CacheKey, CacheEntry>>,
    key_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    closed: AtomicBool,
}

impl CacheStore {
    /// Open the store at `root`, loading every committed entry.
    ///
    /// Files that cannot be read or parsed are skipped with a warning.
    #[tracing::instrument(name = "open_cache", skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>, settings: CacheSettings) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let scan_root = root.clone();
        let entries = task::spawn_blocking(move || load_entries(&scan_root)).await??;

        info!(entries = entries.len(), "Cache store opened");

        Ok(Self {
            root,
            settings,
            index: RwLock::new(entries),
            key_locks: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key of the bucket containing `at`
    #[must_use]
    pub fn key_for(&self, subject: &str, kind: RecordKind, at: DateTime<Utc>) -> CacheKey {
        CacheKey::new(subject, kind, TimeBucket::of(at, self.settings.bucket))
    }

    /// Key of the bucket a record belongs to
    #[must_use]
    pub fn key_of(&self, record: &Record) -> CacheKey {
        CacheKey::for_record(record, self.settings.bucket)
    }

    #[must_use]
    pub fn freshness(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Freshness {
        entry.freshness(self.settings.grace, now)
    }

    /// Copy of the entry stored under `key`
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.index.read().await.get(key).cloned()
    }

    /// Newest entry for `(subject, kind)` whose bucket does not start after
    /// the bucket of `at`.
    ///
    /// The entry of `at`'s own bucket is always eligible. Earlier buckets
    /// only count while they are not [`Freshness::Expired`] at `now`.
    pub async fn latest(
        &self,
        subject: &str,
        kind: RecordKind,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let target = self.key_for(subject, kind, at);
        self.index
            .read()
            .await
            .values()
            .filter(|entry| entry.key.subject == target.subject && entry.key.kind == kind)
            .filter(|entry| entry.key.bucket <= target.bucket)
            .filter(|entry| {
                entry.key.bucket == target.bucket || self.freshness(entry, now) != Freshness::Expired
            })
            .max_by_key(|entry| entry.key.bucket)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    pub async fn put(&self, key: CacheKey, record: Record) -> Result<CacheEntry, CacheError> {
        self.put_all(key, vec![record]).await
    }

    /// Add or replace records of `key` and persist the entry before returning
    #[tracing::instrument(
        name = "put_cache",
        level = "debug",
        skip_all,
        fields(key = %key, records = records.len())
    )]
    pub async fn put_all(&self, key: CacheKey, records: Vec<Record>) -> Result<CacheEntry, CacheError> {
        self.ensure_open()?;

        if let Err(e) = self.evict_expired(self.settings.grace).await {
            warn!(error = %e, "Opportunistic eviction failed");
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let mut entry = self.get(&key).await.unwrap_or_else(|| CacheEntry {
            key: key.clone(),
            records: Vec::new(),
            expires_at: Utc::now(),
        });
        for record in records {
            entry.upsert(record);
        }
        entry.expires_at = self.expiry_of(&entry);

        self.write_entry(&entry).await?;
        self.index.write().await.insert(key, entry.clone());
        debug!(expires_at = %entry.expires_at, "Entry written");

        Ok(entry)
    }

    /// Remove every entry whose `expires_at + grace` has passed
    #[tracing::instrument(name = "evict_cache", level = "debug", skip(self))]
    pub async fn evict_expired(&self, grace: Duration) -> Result<usize, CacheError> {
        self.ensure_open()?;
        let now = Utc::now();

        let candidates: Vec<CacheKey> = self
            .index
            .read()
            .await
            .values()
            .filter(|entry| entry.freshness(grace, now) == Freshness::Expired)
            .map(|entry| entry.key.clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            let lock = self.lock_for(&key);
            let _guard = lock.lock().await;

            let still_expired = self
                .index
                .read()
                .await
                .get(&key)
                .is_some_and(|entry| entry.freshness(grace, now) == Freshness::Expired);
            if !still_expired {
                continue;
            }

            let path = self.path_for(&key);
            task::spawn_blocking(move || remove_entry_file(&path)).await??;
            self.index.write().await.remove(&key);
            // Writers already waiting on this lock keep it alive
            self.key_locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) <= 2);
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Evicted expired cache entries");
        }
        Ok(removed)
    }

    /// Reject every later write
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(root = %self.root.display(), "Cache store closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn expiry_of(&self, entry: &CacheEntry) -> DateTime<Utc> {
        let Some(newest) = entry.newest_record() else {
            return Utc::now();
        };
        let ttl = self.settings.jittered(self.settings.ttl_for(newest));
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        newest
            .fetched_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.kind.as_str())
            .join(urlencoding::encode(&key.subject).into_owned())
            .join(format!("{}.json", key.bucket.file_stem()))
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.key);
        let json = serde_json::to_vec_pretty(entry).map_err(|source| CacheError::Serialization {
            path: path.clone(),
            source,
        })?;

        task::spawn_blocking(move || write_atomically(&path, &json)).await?
    }
}

/// Write to a temporary sibling, fsync, then rename over the target
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;

    let mut file = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    file.write_all(bytes).map_err(io_error(file.path()))?;
    file.as_file().sync_all().map_err(io_error(path))?;
    file.persist(path).map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn remove_entry_file(path: &Path) -> Result<(), CacheError> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(path)(e)),
    }
    // Drop the subject directory once its last bucket is gone
    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir(dir);
    }
    Ok(())
}

fn load_entries(root: &Path) -> Result<HashMap<CacheKey, CacheEntry>, CacheError> {
    std::fs::create_dir_all(root).map_err(io_error(root))?;

    let mut entries = HashMap::new();
    for kind in RecordKind::ALL {
        let kind_dir = root.join(kind.as_str());
        let Ok(subjects) = std::fs::read_dir(&kind_dir) else {
            continue;
        };

        for subject_dir in subjects.flatten() {
            let Ok(files) = std::fs::read_dir(subject_dir.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_entry(&path) {
                    Ok(entry) => {
                        entries.insert(entry.key.clone(), entry);
                    }
                    Err(reason) => {
                        warn!(path = %path.display(), %reason, "Skipping unreadable cache file");
                    }
                }
            }
        }
    }
    Ok(entries)
}

fn read_entry(path: &Path) -> Result<CacheEntry, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}
