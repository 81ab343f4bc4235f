//! Static per-source configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::record::RecordKind;

/// Token-bucket politeness budget of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Bucket size, i.e. the largest burst admitted at once
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// One token is added back every interval
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
    /// Maximum requests in flight; defaults to `capacity`
    #[serde(default)]
    pub max_concurrent: Option<u32>,
}

fn default_capacity() -> u32 {
    2
}

fn default_refill_interval_ms() -> u64 {
    1000
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_interval_ms: default_refill_interval_ms(),
            max_concurrent: None,
        }
    }
}

impl RateLimitPolicy {
    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    #[must_use]
    pub fn concurrency_cap(&self) -> u32 {
        self.max_concurrent.unwrap_or(self.capacity).max(1)
    }
}

/// How a scraped value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Number,
    Text,
    Timestamp,
}

/// One field extracted from markup with a CSS selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlField {
    pub selector: String,
    /// Read this attribute instead of the element text
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    /// A missing optional field is skipped instead of failing the page
    #[serde(default)]
    pub optional: bool,
}

/// Extraction rules of an HTML-scrape source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlMapping {
    /// One record per matched element; the whole page is one record when absent
    #[serde(default)]
    pub row_selector: Option<String>,
    /// Element carrying the observation time
    #[serde(default)]
    pub time_selector: Option<String>,
    #[serde(default)]
    pub time_format: Option<String>,
    /// Grouping separator stripped before parsing numbers (e.g. "." in "12.345")
    #[serde(default)]
    pub thousands_separator: Option<String>,
    pub fields: BTreeMap<String, HtmlField>,
}

/// Extraction rules of a JSON-API source, in dotted paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonMapping {
    /// Path of the observation time; an array switches to columnar mode
    pub time: String,
    #[serde(default)]
    pub time_format: Option<String>,
    /// Attribute name to dotted path
    pub fields: BTreeMap<String, String>,
}

/// One CSV column mapped to an attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvField {
    pub column: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
}

/// Extraction rules of a CSV-import source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvMapping {
    /// Rows whose subject column differs from the requested subject are ignored
    #[serde(default)]
    pub subject_column: Option<String>,
    pub time_column: String,
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Fail the whole fetch when more than this share of rows is malformed
    #[serde(default = "default_max_skip_ratio")]
    pub max_skip_ratio: f64,
    pub fields: BTreeMap<String, CsvField>,
}

fn default_delimiter() -> char {
    ','
}

fn default_max_skip_ratio() -> f64 {
    0.2
}

/// Format-specific part of a descriptor; picks the adapter variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMapping {
    Html(HtmlMapping),
    Json(JsonMapping),
    Csv(CsvMapping),
}

impl SourceMapping {
    #[must_use]
    pub fn format_name(&self) -> &'static str {
        match self {
            SourceMapping::Html(_) => "html",
            SourceMapping::Json(_) => "json",
            SourceMapping::Csv(_) => "csv",
        }
    }
}

/// Identity, access point and policies of one external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    /// URL or file path template (`{subject}`, `{lat}`, `{lng}`, ...)
    pub access_point: String,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    /// Higher wins attribute conflicts during merge
    #[serde(default)]
    pub trust_priority: i32,
    /// Overrides the kind-specific cache TTL for records of this source
    #[serde(default)]
    pub ttl_minutes: Option<u64>,
    pub kinds: Vec<RecordKind>,
    pub mapping: SourceMapping,
}

impl SourceDescriptor {
    #[must_use]
    pub fn supports(&self, kind: RecordKind) -> bool {
        self.kinds.contains(&kind)
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_minutes.map(|m| Duration::from_secs(m * 60))
    }
}
