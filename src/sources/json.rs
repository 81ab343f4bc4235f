//! JSON-API adapter
//!
//! Payloads are walked as a generic `serde_json::Value` with dotted paths
//! (`hourly.temperature_2m`, `data.0.price`). When the time path holds an
//! array the mapping is columnar: every mapped field must be an array of the
//! same length and index `i` of each array forms record `i`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::http::get_text;
use super::values::parse_timestamp;
use super::{FetchError, SourceAdapter, log_content_error, render_access_point};
use crate::locations::LocationDirectory;
use crate::models::{FieldValue, JsonMapping, Record, RecordKind, SourceDescriptor, SourceMapping};

pub struct JsonSource {
    descriptor: SourceDescriptor,
    client: Client,
    locations: Option<Arc<LocationDirectory>>,
}

impl JsonSource {
    pub fn new(
        descriptor: SourceDescriptor,
        client: Client,
        locations: Option<Arc<LocationDirectory>>,
    ) -> Self {
        Self {
            descriptor,
            client,
            locations,
        }
    }

    fn mapping(&self) -> Result<&JsonMapping, FetchError> {
        match &self.descriptor.mapping {
            SourceMapping::Json(mapping) => Ok(mapping),
            other => Err(FetchError::format(
                &self.descriptor.id,
                format!("expected a json mapping, found {}", other.format_name()),
            )),
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self, cancel), fields(source = %self.descriptor.id))]
    async fn fetch(
        &self,
        subject: &str,
        kind: RecordKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, FetchError> {
        let mapping = self.mapping()?;
        let url = render_access_point(
            &self.descriptor.access_point,
            subject,
            self.locations.as_deref(),
        );
        let body = get_text(&self.client, &self.descriptor.id, &url, cancel).await?;

        let records = map_document(
            &self.descriptor.id,
            mapping,
            &body,
            subject,
            kind,
            Utc::now(),
        )
        .inspect_err(log_content_error)?;
        debug!(count = records.len(), "Mapped records");
        Ok(records)
    }
}

/// Resolve a dotted path; numeric segments index into arrays
pub fn lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Map a raw JSON body to records
pub fn map_document(
    source_id: &str,
    mapping: &JsonMapping,
    body: &str,
    subject: &str,
    kind: RecordKind,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Record>, FetchError> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::parse(source_id, format!("invalid JSON: {e}"), body))?;

    let time = lookup(&root, &mapping.time).ok_or_else(|| {
        FetchError::schema(source_id, format!("time path '{}' not found", mapping.time), body)
    })?;
    let read_time = |value: &Value| {
        json_timestamp(value, mapping.time_format.as_deref()).ok_or_else(|| {
            FetchError::schema(source_id, format!("unreadable time value {value}"), body)
        })
    };

    let mut columns = Vec::with_capacity(mapping.fields.len());
    for (name, path) in &mapping.fields {
        let value = lookup(&root, path).ok_or_else(|| {
            FetchError::schema(source_id, format!("path '{path}' for '{name}' not found"), body)
        })?;
        columns.push((name, path, value));
    }

    let Value::Array(times) = time else {
        let mut record = Record::new(subject, kind, source_id, read_time(time)?, fetched_at);
        for (name, path, value) in columns {
            if value.is_array() || value.is_object() {
                return Err(FetchError::schema(
                    source_id,
                    format!("path '{path}' holds a structure, expected a scalar"),
                    body,
                ));
            }
            if let Some(value) = scalar(value) {
                record.fields.insert(name.clone(), value);
            }
        }
        return Ok(vec![record]);
    };

    let mut arrays = Vec::with_capacity(columns.len());
    for (name, path, value) in columns {
        match value {
            Value::Array(items) if items.len() == times.len() => arrays.push((name, items)),
            Value::Array(items) => {
                return Err(FetchError::schema(
                    source_id,
                    format!(
                        "column '{path}' has {} values but the time column has {}",
                        items.len(),
                        times.len()
                    ),
                    body,
                ));
            }
            _ => {
                return Err(FetchError::schema(
                    source_id,
                    format!("path '{path}' is not an array in columnar mode"),
                    body,
                ));
            }
        }
    }

    times
        .iter()
        .enumerate()
        .map(|(i, time)| {
            let mut record = Record::new(subject, kind, source_id, read_time(time)?, fetched_at);
            for (name, items) in &arrays {
                if let Some(value) = scalar(&items[i]) {
                    record.fields.insert((*name).clone(), value);
                }
            }
            Ok(record)
        })
        .collect()
}

fn json_timestamp(value: &Value, format: Option<&str>) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp(raw, format),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

/// Nulls are dropped; booleans become text
fn scalar(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Number(n) => n.as_f64().map(FieldValue::Number),
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
        _ => None,
    }
}
