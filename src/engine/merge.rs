//! Conflict resolution between records of one cache key

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{CacheKey, FieldValue, Record, RecordKind, TimeBucket};

/// Precedence inputs of one source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRank {
    pub trust_priority: i32,
    pub last_success: Option<DateTime<Utc>>,
    pub declaration_index: usize,
}

impl Default for SourceRank {
    /// Sources no longer configured rank below every configured one
    fn default() -> Self {
        Self {
            trust_priority: i32::MIN,
            last_success: None,
            declaration_index: usize::MAX,
        }
    }
}

/// Merged view of every source's record for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub subject: String,
    pub kind: RecordKind,
    pub bucket: TimeBucket,
    /// Newest `observed_at` among the contributing records
    pub observed_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Attribute name to the source whose value was kept
    pub provenance: BTreeMap<String, String>,
    /// Contributing sources, highest precedence first
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    ranks: HashMap<String, SourceRank>,
}

impl MergePolicy {
    pub fn new(ranks: HashMap<String, SourceRank>) -> Self {
        Self { ranks }
    }

    fn rank_of(&self, source_id: &str) -> SourceRank {
        self.ranks.get(source_id).cloned().unwrap_or_default()
    }

    /// Trust priority (desc), last successful fetch (desc, never last),
    /// declaration order, then source id
    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let (ra, rb) = (self.rank_of(&a.source_id), self.rank_of(&b.source_id));
        rb.trust_priority
            .cmp(&ra.trust_priority)
            .then_with(|| rb.last_success.cmp(&ra.last_success))
            .then_with(|| ra.declaration_index.cmp(&rb.declaration_index))
            .then_with(|| a.source_id.cmp(&b.source_id))
    }

    /// Latest record of each source, highest precedence first.
    ///
    /// The result depends only on the records and the ranks, never on the
    /// order records arrived in.
    pub fn order<'r>(&self, records: &'r [Record]) -> Vec<&'r Record> {
        let mut latest: HashMap<&str, &Record> = HashMap::new();
        for record in records {
            latest
                .entry(record.source_id.as_str())
                .and_modify(|current| {
                    if (record.observed_at, record.fetched_at)
                        > (current.observed_at, current.fetched_at)
                    {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut ordered: Vec<&Record> = latest.into_values().collect();
        ordered.sort_by(|a, b| self.compare(a, b));
        ordered
    }

    /// Union of all attributes; on conflict the higher-precedence source wins
    pub fn merge(&self, key: &CacheKey, records: &[Record]) -> Option<MergedRecord> {
        let ordered = self.order(records);
        let first = ordered.first()?;

        let mut merged = MergedRecord {
            subject: key.subject.clone(),
            kind: key.kind,
            bucket: key.bucket,
            observed_at: first.observed_at,
            fetched_at: first.fetched_at,
            fields: BTreeMap::new(),
            provenance: BTreeMap::new(),
            sources: Vec::with_capacity(ordered.len()),
        };

        for record in ordered {
            merged.observed_at = merged.observed_at.max(record.observed_at);
            merged.fetched_at = merged.fetched_at.max(record.fetched_at);
            merged.sources.push(record.source_id.clone());
            for (name, value) in &record.fields {
                if !merged.fields.contains_key(name) {
                    merged.fields.insert(name.clone(), value.clone());
                    merged
                        .provenance
                        .insert(name.clone(), record.source_id.clone());
                }
            }
        }

        Some(merged)
    }
}
