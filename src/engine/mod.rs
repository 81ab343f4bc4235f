//! Aggregation engine
//!
//! Decides per query whether the cache can answer or the sources must be
//! asked, fans fetches out across every eligible source, merges the results
//! and writes them back to the cache.

pub mod merge;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheStore;
use crate::models::{
    CacheEntry, CacheKey, Freshness, Record, RecordKind, SourceDescriptor, normalize_subject,
};
use crate::scheduler::FetchScheduler;
use crate::sources::{FetchError, SourceAdapter, SourceFailure};

pub use merge::{MergePolicy, MergedRecord, SourceRank};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("All sources failed for {kind} '{subject}': {}", describe(failures))]
    AllSourcesFailed {
        subject: String,
        kind: RecordKind,
        failures: Vec<SourceFailure>,
    },

    #[error("No configured source supplies {kind} data")]
    NoSources { kind: RecordKind },
}

fn describe(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Where a snapshot's records came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    Cache,
    Network,
}

/// Consistent answer to one query
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: CacheKey,
    /// Contributing records, one per source
    pub records: Vec<Record>,
    /// `None` when no source had data for the bucket
    pub merged: Option<MergedRecord>,
    pub freshness: Freshness,
    pub origin: SnapshotOrigin,
    /// Served from cache because every live fetch failed
    pub degraded: bool,
    /// Sources that failed during this query
    pub failures: Vec<SourceFailure>,
}

impl Snapshot {
    #[must_use]
    pub fn failing_sources(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.source_id.as_str()).collect()
    }
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deadline shared by all source fetches of one query
    pub query_timeout: Duration,
    /// Global cap on fetches in flight, across queries and sources
    pub max_in_flight_fetches: usize,
    /// Answer stale hits immediately and refresh in the background
    pub serve_stale_while_refresh: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            max_in_flight_fetches: 8,
            serve_stale_while_refresh: false,
        }
    }
}

struct EngineInner {
    sources: Vec<Arc<dyn SourceAdapter>>,
    cache: Arc<CacheStore>,
    scheduler: FetchScheduler,
    settings: EngineSettings,
    last_success: DashMap<String, DateTime<Utc>>,
    in_flight: Semaphore,
    refreshing: DashMap<CacheKey, ()>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share sources, cache and limiter state
#[derive(Clone)]
pub struct AggregationEngine {
    inner: Arc<EngineInner>,
}

impl AggregationEngine {
    /// `sources` are kept in declaration order, which is the last merge tiebreak
    pub fn new(
        sources: Vec<Arc<dyn SourceAdapter>>,
        cache: Arc<CacheStore>,
        scheduler: FetchScheduler,
        settings: EngineSettings,
    ) -> Self {
        let in_flight = Semaphore::new(settings.max_in_flight_fetches.max(1));
        Self {
            inner: Arc::new(EngineInner {
                sources,
                cache,
                scheduler,
                settings,
                last_success: DashMap::new(),
                in_flight,
                refreshing: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.inner.sources.iter().map(|s| s.descriptor())
    }

    /// Cancel every fetch in progress and refuse new ones
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub async fn query(&self, subject: &str, kind: RecordKind) -> Result<Snapshot, AggregationError> {
        self.query_at(subject, kind, Utc::now()).await
    }

    /// Answer for the time bucket containing `at`.
    ///
    /// When that bucket holds nothing, the newest usable earlier bucket of
    /// the same subject answers instead.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn query_at(
        &self,
        subject: &str,
        kind: RecordKind,
        at: DateTime<Utc>,
    ) -> Result<Snapshot, AggregationError> {
        let subject = normalize_subject(subject);
        let cache = &self.inner.cache;
        let cached = cache.latest(&subject, kind, at, Utc::now()).await;

        if let Some(entry) = &cached {
            let key = &entry.key;
            match cache.freshness(entry, Utc::now()) {
                Freshness::Fresh => {
                    debug!(%key, "Serving fresh cache entry");
                    return Ok(self.from_cache(entry, Freshness::Fresh, Vec::new(), false));
                }
                Freshness::Stale if self.inner.settings.serve_stale_while_refresh => {
                    debug!(%key, "Serving stale entry while refreshing");
                    self.spawn_refresh(subject.clone(), kind, at);
                    return Ok(self.from_cache(entry, Freshness::Stale, Vec::new(), false));
                }
                freshness => debug!(%key, ?freshness, "Cache entry needs refresh"),
            }
        }

        self.fetch_and_merge(&subject, kind, at, cached).await
    }

    /// Run many queries at once; duplicate `(subject, kind)` pairs are fetched once
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub async fn bulk_query(
        &self,
        requests: &[(String, RecordKind)],
    ) -> HashMap<(String, RecordKind), Result<Snapshot, AggregationError>> {
        let at = Utc::now();
        let mut seen = HashSet::new();
        let unique: Vec<(String, RecordKind)> = requests
            .iter()
            .map(|(subject, kind)| (normalize_subject(subject), *kind))
            .filter(|request| seen.insert(request.clone()))
            .collect();

        let mut calls = Vec::with_capacity(unique.len());
        for (subject, kind) in &unique {
            calls.push(self.query_at(subject, *kind, at));
        }
        let results = join_all(calls).await;

        unique.into_iter().zip(results).collect()
    }

    fn from_cache(
        &self,
        entry: &CacheEntry,
        freshness: Freshness,
        failures: Vec<SourceFailure>,
        degraded: bool,
    ) -> Snapshot {
        Snapshot {
            key: entry.key.clone(),
            records: entry.records.clone(),
            merged: self.merge_policy().merge(&entry.key, &entry.records),
            freshness,
            origin: SnapshotOrigin::Cache,
            degraded,
            failures,
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        let ranks = self
            .inner
            .sources
            .iter()
            .enumerate()
            .map(|(declaration_index, source)| {
                let descriptor = source.descriptor();
                let rank = SourceRank {
                    trust_priority: descriptor.trust_priority,
                    last_success: self.inner.last_success.get(&descriptor.id).map(|t| *t),
                    declaration_index,
                };
                (descriptor.id.clone(), rank)
            })
            .collect();
        MergePolicy::new(ranks)
    }

    fn spawn_refresh(&self, subject: String, kind: RecordKind, at: DateTime<Utc>) {
        let key = self.inner.cache.key_for(&subject, kind, at);
        if self.inner.refreshing.insert(key.clone(), ()).is_some() {
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let cached = engine.inner.cache.latest(&subject, kind, at, Utc::now()).await;
            match engine.fetch_and_merge(&subject, kind, at, cached).await {
                Ok(snapshot) => debug!(%key, degraded = snapshot.degraded, "Background refresh done"),
                Err(e) => warn!(%key, error = %e, "Background refresh failed"),
            }
            engine.inner.refreshing.remove(&key);
        });
    }

    async fn fetch_and_merge(
        &self,
        subject: &str,
        kind: RecordKind,
        at: DateTime<Utc>,
        cached: Option<CacheEntry>,
    ) -> Result<Snapshot, AggregationError> {
        let eligible: Vec<Arc<dyn SourceAdapter>> = self
            .inner
            .sources
            .iter()
            .filter(|s| s.descriptor().supports(kind))
            .cloned()
            .collect();

        if eligible.is_empty() {
            return match cached {
                Some(entry) => {
                    let freshness = self.inner.cache.freshness(&entry, Utc::now());
                    Ok(self.from_cache(&entry, freshness, Vec::new(), false))
                }
                None => Err(AggregationError::NoSources { kind }),
            };
        }

        let outcomes = self.fetch_all(subject, kind, &eligible).await;
        let completed_at = Utc::now();

        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for (source_id, outcome) in outcomes {
            match outcome {
                Ok(records) => {
                    self.inner.last_success.insert(source_id, completed_at);
                    fetched.extend(records);
                }
                Err(error) => {
                    warn!(source = %source_id, %error, "Source failed");
                    failures.push(SourceFailure::new(&source_id, error));
                }
            }
        }

        if failures.len() == eligible.len() {
            // Another query may have filled a bucket while this one was fetching
            let fallback = match self.inner.cache.latest(subject, kind, at, Utc::now()).await {
                Some(entry) => Some(entry),
                None => cached,
            };
            return match fallback {
                Some(entry) => {
                    let freshness = self.inner.cache.freshness(&entry, Utc::now());
                    warn!(key = %entry.key, ?freshness, failed = failures.len(), "All sources failed, serving cached entry");
                    Ok(self.from_cache(&entry, freshness, failures, true))
                }
                None => Err(AggregationError::AllSourcesFailed {
                    subject: subject.to_string(),
                    kind,
                    failures,
                }),
            };
        }

        let mut by_bucket = self.group_by_bucket(fetched);
        for (bucket_key, records) in &by_bucket {
            if let Err(e) = self.inner.cache.put_all(bucket_key.clone(), records.clone()).await {
                warn!(key = %bucket_key, error = %e, "Failed to write fetched records to cache");
            }
        }

        // Sources may report an observation from an earlier bucket than `at`
        let query_key = self.inner.cache.key_for(subject, kind, at);
        let answering = by_bucket
            .keys()
            .filter(|k| k.subject == query_key.subject && k.kind == kind)
            .filter(|k| k.bucket <= query_key.bucket)
            .max()
            .cloned();
        let (key, records) = answering
            .and_then(|k| by_bucket.remove_entry(&k))
            .unwrap_or((query_key, Vec::new()));
        info!(
            %key,
            records = records.len(),
            failed = failures.len(),
            "Fetched fresh snapshot"
        );
        Ok(Snapshot {
            merged: self.merge_policy().merge(&key, &records),
            key,
            records,
            freshness: Freshness::Fresh,
            origin: SnapshotOrigin::Network,
            degraded: false,
            failures,
        })
    }

    /// Fetch from every eligible source concurrently under one deadline.
    ///
    /// Outcomes are returned in declaration order whatever the completion
    /// order was.
    async fn fetch_all(
        &self,
        subject: &str,
        kind: RecordKind,
        eligible: &[Arc<dyn SourceAdapter>],
    ) -> Vec<(String, Result<Vec<Record>, FetchError>)> {
        let cancel = self.inner.shutdown.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let deadline = Instant::now() + self.inner.settings.query_timeout;

        let mut calls = Vec::with_capacity(eligible.len());
        for source in eligible {
            calls.push(self.fetch_one(source.as_ref(), subject, kind, &cancel, deadline));
        }
        let outcomes = join_all(calls).await;

        // Nothing may outlive the query
        cancel.cancel();
        outcomes
    }

    async fn fetch_one(
        &self,
        source: &dyn SourceAdapter,
        subject: &str,
        kind: RecordKind,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> (String, Result<Vec<Record>, FetchError>) {
        let source_id = source.id().to_string();
        let in_flight = &self.inner.in_flight;

        let attempt = self.inner.scheduler.schedule(&source_id, cancel, move || async move {
            let _permit = in_flight
                .acquire()
                .await
                .map_err(|_| FetchError::cancelled(source.id()))?;
            source.fetch(subject, kind, cancel).await
        });

        let outcome = match timeout_at(deadline, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::Timeout {
                source_id: source_id.clone(),
                after_ms: self.inner.settings.query_timeout.as_millis() as u64,
            }),
        };

        (source_id, outcome)
    }

    /// Keep each source's latest record per bucket, in fetch order
    fn group_by_bucket(&self, fetched: Vec<Record>) -> BTreeMap<CacheKey, Vec<Record>> {
        let mut groups: BTreeMap<CacheKey, Vec<Record>> = BTreeMap::new();
        for record in fetched {
            let records = groups.entry(self.inner.cache.key_of(&record)).or_default();
            match records.iter_mut().find(|r| r.source_id == record.source_id) {
                Some(existing) if record.observed_at >= existing.observed_at => *existing = record,
                Some(_) => {}
                None => records.push(record),
            }
        }
        groups
    }
}
