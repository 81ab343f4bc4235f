//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use weathertravel::models::{JsonMapping, RateLimitPolicy, SourceDescriptor, SourceMapping};
use weathertravel::{
    AggregationEngine, CacheSettings, CacheStore, EngineSettings, FetchError, FetchScheduler,
    Record, RecordKind, SchedulerSettings, SourceAdapter,
};

/// Default observation time of fixture records
pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap()
}

/// In-memory source with a scripted answer
pub struct MockSource {
    descriptor: SourceDescriptor,
    fields: Vec<(String, f64)>,
    failure: Option<FetchError>,
    delay: Duration,
    observed_at: DateTime<Utc>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    last_cancel: Mutex<Option<CancellationToken>>,
}

impl MockSource {
    pub fn new(id: &str, trust_priority: i32) -> Self {
        Self {
            descriptor: SourceDescriptor {
                id: id.to_string(),
                access_point: format!("https://{id}.example.com/{{subject}}"),
                rate_limit: RateLimitPolicy {
                    capacity: 10,
                    refill_interval_ms: 10,
                    max_concurrent: None,
                },
                trust_priority,
                ttl_minutes: None,
                kinds: vec![RecordKind::Weather],
                mapping: SourceMapping::Json(JsonMapping {
                    time: "time".to_string(),
                    time_format: None,
                    fields: BTreeMap::new(),
                }),
            },
            fields: Vec::new(),
            failure: None,
            delay: Duration::ZERO,
            observed_at: noon(),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            last_cancel: Mutex::new(None),
        }
    }

    pub fn field(mut self, name: &str, value: f64) -> Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(FetchError::format(&self.descriptor.id, message));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn observed(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most fetches that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Cancellation token handed to the latest fetch
    pub fn last_cancel(&self) -> Option<CancellationToken> {
        self.last_cancel.lock().unwrap().clone()
    }

    pub fn record(&self, subject: &str, fetched_at: DateTime<Utc>) -> Record {
        self.fields.iter().fold(
            Record::new(subject, RecordKind::Weather, &self.descriptor.id, self.observed_at, fetched_at),
            |record, (name, value)| record.with_field(name, *value),
        )
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(
        &self,
        subject: &str,
        _kind: RecordKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_cancel.lock().unwrap() = Some(cancel.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let finished = tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.delay) => true,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        if !finished {
            return Err(FetchError::cancelled(&self.descriptor.id));
        }
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(vec![self.record(subject, Utc::now())]),
        }
    }
}

pub struct Harness {
    pub engine: AggregationEngine,
    pub cache: Arc<CacheStore>,
    pub dir: TempDir,
}

pub fn scheduler_settings() -> SchedulerSettings {
    SchedulerSettings {
        admission_timeout: Duration::from_secs(1),
        max_retries: 0,
        retry_min: Duration::from_millis(10),
        retry_max: Duration::from_millis(50),
    }
}

pub async fn harness(sources: &[Arc<MockSource>], settings: EngineSettings) -> Harness {
    harness_in(TempDir::new().unwrap(), sources, settings).await
}

/// Engine over an existing cache directory
pub async fn harness_in(dir: TempDir, sources: &[Arc<MockSource>], settings: EngineSettings) -> Harness {
    let descriptors: Vec<SourceDescriptor> = sources.iter().map(|s| s.descriptor().clone()).collect();
    let adapters = sources
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn SourceAdapter>)
        .collect();
    let cache = Arc::new(CacheStore::open(dir.path(), CacheSettings::default()).await.unwrap());
    let scheduler = FetchScheduler::new(&descriptors, scheduler_settings());
    let engine = AggregationEngine::new(adapters, Arc::clone(&cache), scheduler, settings);
    Harness { engine, cache, dir }
}
