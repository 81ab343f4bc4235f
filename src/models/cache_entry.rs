//! Cache key and persisted cache entry model

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordKind, normalize_subject};

/// Coarse time slot a record belongs to (start of the slot, UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeBucket(DateTime<Utc>);

impl TimeBucket {
    /// Truncate `at` down to a multiple of `granularity` since the Unix epoch
    #[must_use]
    pub fn of(at: DateTime<Utc>, granularity: Duration) -> Self {
        let step = i64::try_from(granularity.as_secs()).unwrap_or(i64::MAX).max(1);
        let start = at.timestamp().div_euclid(step) * step;
        let start = Utc.timestamp_opt(start, 0).single().unwrap_or(at);
        Self(start)
    }

    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// Compact form used in file names, e.g. `20240611T1400`
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.0.format("%Y%m%dT%H%M").to_string()
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%MZ"))
    }
}

/// `(subject, kind, time bucket)` key of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub subject: String,
    pub kind: RecordKind,
    pub bucket: TimeBucket,
}

impl CacheKey {
    #[must_use]
    pub fn new(subject: &str, kind: RecordKind, bucket: TimeBucket) -> Self {
        Self {
            subject: normalize_subject(subject),
            kind,
            bucket,
        }
    }

    /// Key of the bucket `record` falls into
    #[must_use]
    pub fn for_record(record: &Record, granularity: Duration) -> Self {
        Self::new(
            &record.subject,
            record.kind,
            TimeBucket::of(record.observed_at, granularity),
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.kind, self.subject, self.bucket)
    }
}

/// How usable a cache entry is at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// `now < expires_at`
    Fresh,
    /// Past `expires_at` but within the grace window
    Stale,
    /// Past `expires_at + grace`
    Expired,
}

/// Persisted, possibly multi-source unit for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// At most one record per source, in fetch order
    pub records: Vec<Record>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    #[must_use]
    pub fn freshness(&self, grace: Duration, now: DateTime<Utc>) -> Freshness {
        if now < self.expires_at {
            return Freshness::Fresh;
        }
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        match self.expires_at.checked_add_signed(grace) {
            Some(limit) if now < limit => Freshness::Stale,
            None => Freshness::Stale,
            Some(_) => Freshness::Expired,
        }
    }

    /// Insert or replace the record of `record.source_id`; the replacement
    /// moves to the end so the sequence stays in fetch order
    pub fn upsert(&mut self, record: Record) {
        self.records.retain(|r| r.source_id != record.source_id);
        self.records.push(record);
    }

    #[must_use]
    pub fn newest_record(&self) -> Option<&Record> {
        self.records.iter().max_by_key(|r| r.fetched_at)
    }

    #[must_use]
    pub fn source_ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.source_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, h, m, s).unwrap()
    }

    #[rstest]
    #[case(at(14, 0, 0), 60, at(14, 0, 0))]
    #[case(at(14, 59, 59), 60, at(14, 0, 0))]
    #[case(at(14, 44, 10), 15, at(14, 30, 0))]
    #[case(at(23, 10, 0), 24 * 60, at(0, 0, 0))]
    fn test_time_bucket_truncation(
        #[case] input: DateTime<Utc>,
        #[case] minutes: u64,
        #[case] expected: DateTime<Utc>,
    ) {
        let bucket = TimeBucket::of(input, Duration::from_secs(minutes * 60));
        assert_eq!(bucket.start(), expected);
    }

    #[test]
    fn test_bucket_file_stem() {
        let bucket = TimeBucket::of(at(9, 5, 0), Duration::from_secs(3600));
        assert_eq!(bucket.file_stem(), "20240611T0900");
        assert_eq!(bucket.to_string(), "2024-06-11T09:00Z");
    }

    #[test]
    fn test_freshness_windows() {
        let key = CacheKey::new("Riverside", RecordKind::Weather, TimeBucket::of(at(10, 0, 0), Duration::from_secs(3600)));
        let entry = CacheEntry {
            key,
            records: vec![],
            expires_at: at(11, 0, 0),
        };
        let grace = Duration::from_secs(30 * 60);

        assert_eq!(entry.freshness(grace, at(10, 59, 0)), Freshness::Fresh);
        assert_eq!(entry.freshness(grace, at(11, 0, 0)), Freshness::Stale);
        assert_eq!(entry.freshness(grace, at(11, 29, 59)), Freshness::Stale);
        assert_eq!(entry.freshness(grace, at(11, 30, 0)), Freshness::Expired);
    }

    #[test]
    fn test_upsert_replaces_by_source_and_keeps_fetch_order() {
        let key = CacheKey::new("riverside", RecordKind::Weather, TimeBucket::of(at(10, 0, 0), Duration::from_secs(3600)));
        let mut entry = CacheEntry {
            key,
            records: vec![],
            expires_at: at(11, 0, 0),
        };
        let a1 = Record::new("riverside", RecordKind::Weather, "a", at(10, 0, 0), at(10, 1, 0)).with_field("t", 1.0);
        let b1 = Record::new("riverside", RecordKind::Weather, "b", at(10, 0, 0), at(10, 2, 0)).with_field("t", 2.0);
        let a2 = Record::new("riverside", RecordKind::Weather, "a", at(10, 15, 0), at(10, 20, 0)).with_field("t", 3.0);

        entry.upsert(a1);
        entry.upsert(b1);
        entry.upsert(a2);

        assert_eq!(entry.source_ids(), vec!["b", "a"]);
        assert_eq!(entry.records[1].fields["t"].as_number(), Some(3.0));
        assert_eq!(entry.newest_record().unwrap().source_id, "a");
    }
}
