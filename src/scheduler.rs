//! Per-source rate limiting and retry scheduling
//!
//! Every source owns a token bucket and a concurrency cap. Requests that
//! cannot be admitted right away wait (up to the admission timeout) instead
//! of being dropped. Transient failures are retried here with exponential
//! backoff so the engine only ever sees the final outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{RetryDecision, RetryPolicy};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{RateLimitPolicy, SourceDescriptor};
use crate::sources::FetchError;

/// Token bucket: `capacity` tokens, one added back per refill interval
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill_interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(policy: &RateLimitPolicy, now: Instant) -> Self {
        let capacity = policy.capacity.max(1);
        Self {
            capacity,
            tokens: capacity,
            refill_interval: policy.refill_interval(),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.refill_interval.is_zero() {
            self.tokens = self.capacity;
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if earned == 0 {
            return;
        }

        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
        if self.tokens == self.capacity {
            self.last_refill = now;
        } else {
            self.last_refill += self.refill_interval * earned;
        }
    }

    /// Take a token if one is available
    pub fn allow_request(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Time until the next token becomes available
    pub fn time_until_next_request(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens > 0 {
            return Duration::ZERO;
        }
        (self.last_refill + self.refill_interval).saturating_duration_since(now)
    }
}

struct SourceLimiter {
    bucket: Mutex<TokenBucket>,
    in_flight: Arc<Semaphore>,
}

/// Scheduler tuning shared by all sources
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Longest a request may wait for a token and a concurrency slot
    pub admission_timeout: Duration,
    pub max_retries: u32,
    pub retry_min: Duration,
    pub retry_max: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_min: Duration::from_millis(200),
            retry_max: Duration::from_secs(5),
        }
    }
}

pub struct FetchScheduler {
    limiters: HashMap<String, SourceLimiter>,
    settings: SchedulerSettings,
    backoff: ExponentialBackoff,
}

impl FetchScheduler {
    pub fn new(sources: &[SourceDescriptor], settings: SchedulerSettings) -> Self {
        let now = Instant::now();
        let limiters = sources
            .iter()
            .map(|source| {
                let limiter = SourceLimiter {
                    bucket: Mutex::new(TokenBucket::new(&source.rate_limit, now)),
                    in_flight: Arc::new(Semaphore::new(
                        source.rate_limit.concurrency_cap() as usize,
                    )),
                };
                (source.id.clone(), limiter)
            })
            .collect();

        let backoff = ExponentialBackoff::builder()
            .retry_bounds(settings.retry_min, settings.retry_max.max(settings.retry_min))
            .build_with_max_retries(settings.max_retries);

        Self {
            limiters,
            settings,
            backoff,
        }
    }

    /// Run `task` for `source_id` once admitted by its limiter.
    ///
    /// `task` is invoked again for every retry of a retriable failure. The
    /// concurrency slot is held for the duration of each attempt only.
    pub async fn schedule<T, F, Fut>(
        &self,
        source_id: &str,
        cancel: &CancellationToken,
        mut task: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let limiter = self
            .limiters
            .get(source_id)
            .ok_or_else(|| FetchError::UnknownSource(source_id.to_string()))?;

        let started = SystemTime::now();
        let mut past_retries = 0;
        loop {
            let outcome = match self.admit(source_id, limiter, cancel).await {
                Ok(permit) => {
                    let result = task().await;
                    drop(permit);
                    result
                }
                Err(err) => Err(err),
            };

            let err = match outcome {
                Err(err) if err.is_retriable() => err,
                other => return other,
            };

            let RetryDecision::Retry { execute_after } =
                self.backoff.should_retry(started, past_retries)
            else {
                warn!(source = source_id, attempts = past_retries + 1, error = %err, "Giving up on source");
                return Err(err);
            };

            let delay = execute_after
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            past_retries += 1;
            debug!(
                source = source_id,
                retry = past_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::cancelled(source_id)),
                () = sleep(delay) => {}
            }
        }
    }

    /// Wait for a concurrency slot, then for a token
    async fn admit(
        &self,
        source_id: &str,
        limiter: &SourceLimiter,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, FetchError> {
        let wait_started = Instant::now();
        let deadline = wait_started + self.settings.admission_timeout;
        let rejected = || FetchError::RateLimitTimeout {
            source_id: source_id.to_string(),
            waited_ms: wait_started.elapsed().as_millis() as u64,
        };

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled(source_id)),
            () = sleep_until(deadline) => return Err(rejected()),
            permit = limiter.in_flight.clone().acquire_owned() => {
                permit.map_err(|_| FetchError::cancelled(source_id))?
            }
        };

        loop {
            let wait = {
                let mut bucket = limiter.bucket.lock().await;
                let now = Instant::now();
                if bucket.allow_request(now) {
                    return Ok(permit);
                }
                bucket.time_until_next_request(now)
            };

            if Instant::now() + wait > deadline {
                return Err(rejected());
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::cancelled(source_id)),
                () = sleep(wait) => {}
            }
        }
    }
}
