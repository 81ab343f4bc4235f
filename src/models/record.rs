//! Normalized observation record shared by every source adapter

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WeatherTravelError;

/// Category of data a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Weather,
    Travel,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Weather, RecordKind::Travel];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Weather => "weather",
            RecordKind::Travel => "travel",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = WeatherTravelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weather" => Ok(RecordKind::Weather),
            "travel" => Ok(RecordKind::Travel),
            other => Err(WeatherTravelError::validation(format!(
                "unknown data kind '{other}' (expected one of: weather, travel)"
            ))),
        }
    }
}

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(t) => f.write_str(t),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// One observation from one source for one subject, kind and time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Case-normalized subject (place name, route identifier, ...)
    pub subject: String,
    pub kind: RecordKind,
    /// Attribute name to value; schema depends on `kind`
    pub fields: BTreeMap<String, FieldValue>,
    /// Identifier of the adapter that produced this record
    pub source_id: String,
    /// Time the data is valid for, taken from the source content
    pub observed_at: DateTime<Utc>,
    /// Time the data was retrieved locally
    pub fetched_at: DateTime<Utc>,
}

impl Record {
    #[must_use]
    pub fn new(
        subject: &str,
        kind: RecordKind,
        source_id: &str,
        observed_at: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: normalize_subject(subject),
            kind,
            fields: BTreeMap::new(),
            source_id: source_id.to_string(),
            observed_at,
            fetched_at,
        }
    }

    /// Builder-style field insertion
    #[must_use]
    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Identity tuple that must be unique inside the cache
    #[must_use]
    pub fn identity(&self) -> (&str, RecordKind, &str, DateTime<Utc>) {
        (&self.subject, self.kind, &self.source_id, self.observed_at)
    }
}

/// Normalize a subject key: trim, collapse inner whitespace, lower-case
#[must_use]
pub fn normalize_subject(subject: &str) -> String {
    subject
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
