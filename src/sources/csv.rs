//! CSV-import adapter
//!
//! Reads a local file or a remote CSV document. Rows that cannot be read
//! (wrong column count, bad number or timestamp) are skipped and counted; the
//! import fails as a whole once the skipped share passes `max_skip_ratio`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::http::load_text;
use super::values::{convert, parse_timestamp};
use super::{FetchError, SourceAdapter, log_content_error, render_access_point};
use crate::locations::LocationDirectory;
use crate::models::{
    CsvMapping, FieldValue, Record, RecordKind, SourceDescriptor, SourceMapping, ValueType,
    normalize_subject,
};

pub struct CsvSource {
    descriptor: SourceDescriptor,
    client: Client,
    locations: Option<Arc<LocationDirectory>>,
}

impl CsvSource {
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

    fn mapping(&self) -> Result<&CsvMapping, FetchError> {
        match &self.descriptor.mapping {
            SourceMapping::Csv(mapping) => Ok(mapping),
            other => Err(FetchError::format(
                &self.descriptor.id,
                format!("expected a csv mapping, found {}", other.format_name()),
            )),
        }
    }
}

#[async_trait]
impl SourceAdapter for CsvSource {
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
        let location = render_access_point(
            &self.descriptor.access_point,
            subject,
            self.locations.as_deref(),
        );
        let body = load_text(&self.client, &self.descriptor.id, &location, cancel).await?;

        let import = import_rows(&self.descriptor.id, mapping, &body, subject, kind, Utc::now())
            .inspect_err(log_content_error)?;
        debug!(
            count = import.records.len(),
            total = import.total_rows,
            skipped = import.skipped_rows,
            "Imported rows"
        );
        Ok(import.records)
    }
}

/// Result of one CSV import
#[derive(Debug)]
pub struct CsvImport {
    pub records: Vec<Record>,
    pub total_rows: usize,
    pub skipped_rows: usize,
}

struct Columns {
    subject: Option<usize>,
    time: usize,
    fields: Vec<(String, usize, ValueType)>,
}

impl Columns {
    fn resolve(
        source_id: &str,
        mapping: &CsvMapping,
        headers: &StringRecord,
        body: &str,
    ) -> Result<Self, FetchError> {
        let position = |column: &str| -> Result<usize, FetchError> {
            headers.iter().position(|h| h.trim() == column).ok_or_else(|| {
                FetchError::schema(source_id, format!("column '{column}' missing from header"), body)
            })
        };

        Ok(Self {
            subject: mapping.subject_column.as_deref().map(position).transpose()?,
            time: position(&mapping.time_column)?,
            fields: mapping
                .fields
                .iter()
                .map(|(name, field)| Ok((name.clone(), position(&field.column)?, field.value_type)))
                .collect::<Result<_, FetchError>>()?,
        })
    }
}

/// Parse a CSV document into records for `subject`
pub fn import_rows(
    source_id: &str,
    mapping: &CsvMapping,
    body: &str,
    subject: &str,
    kind: RecordKind,
    fetched_at: DateTime<Utc>,
) -> Result<CsvImport, FetchError> {
    let delimiter = u8::try_from(mapping.delimiter).map_err(|_| {
        FetchError::format(source_id, format!("delimiter '{}' is not ASCII", mapping.delimiter))
    })?;

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| FetchError::format(source_id, format!("unreadable header row: {e}")))?
        .clone();
    if headers.is_empty() {
        return Err(FetchError::format(source_id, "header row is missing"));
    }
    let columns = Columns::resolve(source_id, mapping, &headers, body)?;
    let wanted = normalize_subject(subject);

    let mut import = CsvImport {
        records: Vec::new(),
        total_rows: 0,
        skipped_rows: 0,
    };

    for (line, result) in reader.records().enumerate() {
        import.total_rows += 1;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                debug!(source = source_id, line = line + 2, error = %e, "Skipping malformed row");
                import.skipped_rows += 1;
                continue;
            }
        };

        if let Some(idx) = columns.subject
            && normalize_subject(row.get(idx).unwrap_or_default()) != wanted
        {
            continue;
        }

        match row_to_record(source_id, mapping, &columns, &row, subject, kind, fetched_at) {
            Some(record) => import.records.push(record),
            None => {
                debug!(source = source_id, line = line + 2, "Skipping row with unreadable values");
                import.skipped_rows += 1;
            }
        }
    }

    if import.total_rows > 0 {
        let ratio = import.skipped_rows as f64 / import.total_rows as f64;
        if ratio > mapping.max_skip_ratio {
            warn!(
                source = source_id,
                skipped = import.skipped_rows,
                total = import.total_rows,
                "Too many malformed rows"
            );
            return Err(FetchError::format(
                source_id,
                format!(
                    "{} of {} rows malformed (limit {:.0}%)",
                    import.skipped_rows,
                    import.total_rows,
                    mapping.max_skip_ratio * 100.0
                ),
            ));
        }
    }

    Ok(import)
}

fn row_to_record(
    source_id: &str,
    mapping: &CsvMapping,
    columns: &Columns,
    row: &StringRecord,
    subject: &str,
    kind: RecordKind,
    fetched_at: DateTime<Utc>,
) -> Option<Record> {
    let observed_at = parse_timestamp(row.get(columns.time)?, mapping.time_format.as_deref())?;

    let mut record = Record::new(subject, kind, source_id, observed_at, fetched_at);
    for (name, idx, value_type) in &columns.fields {
        let raw = row.get(*idx)?.trim();
        if raw.is_empty() {
            continue;
        }
        let value = match value_type {
            ValueType::Number => FieldValue::Number(raw.parse().ok()?),
            other => convert(raw, *other, mapping.time_format.as_deref(), None)?,
        };
        record.fields.insert(name.clone(), value);
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CsvField;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn mapping(max_skip_ratio: f64) -> CsvMapping {
        let mut fields = BTreeMap::new();
        fields.insert(
            "temperature".to_string(),
            CsvField {
                column: "temp_c".to_string(),
                value_type: ValueType::Number,
            },
        );
        fields.insert(
            "summary".to_string(),
            CsvField {
                column: "sky".to_string(),
                value_type: ValueType::Text,
            },
        );
        CsvMapping {
            subject_column: Some("city".to_string()),
            time_column: "date".to_string(),
            time_format: None,
            delimiter: ',',
            max_skip_ratio,
            fields,
        }
    }

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, 14, 5, 0).unwrap()
    }

    #[test]
    fn test_rows_filtered_by_subject() {
        let body = "city,date,temp_c,sky\n\
                    Riverside,2024-06-11 14:00,21,sunny\n\
                    Lakeside,2024-06-11 14:00,18,rain\n\
                    RIVERSIDE,2024-06-11 15:00,22,\n";

        let import =
            import_rows("history", &mapping(0.2), body, "riverside", RecordKind::Weather, fetched_at())
                .unwrap();
        assert_eq!(import.total_rows, 3);
        assert_eq!(import.skipped_rows, 0);
        assert_eq!(import.records.len(), 2);
        assert_eq!(import.records[0].fields["temperature"].as_number(), Some(21.0));
        assert_eq!(import.records[0].fields["summary"].as_text(), Some("sunny"));
        assert!(!import.records[1].fields.contains_key("summary"));
    }

    #[test]
    fn test_malformed_rows_are_skipped_below_threshold() {
        let body = "city,date,temp_c,sky\n\
                    riverside,2024-06-11 10:00,20,sunny\n\
                    riverside,2024-06-11 11:00,21,sunny\n\
                    riverside,2024-06-11 12:00,22,sunny\n\
                    riverside,2024-06-11 13:00,warm,sunny\n\
                    riverside,2024-06-11 14:00,23,sunny\n";

        let import =
            import_rows("history", &mapping(0.2), body, "riverside", RecordKind::Weather, fetched_at())
                .unwrap();
        assert_eq!(import.total_rows, 5);
        assert_eq!(import.skipped_rows, 1);
        assert_eq!(import.records.len(), 4);
    }

    #[test]
    fn test_too_many_malformed_rows_is_format_error() {
        let body = "city,date,temp_c,sky\n\
                    riverside,2024-06-11 10:00,20,sunny\n\
                    riverside,yesterday,21,sunny\n\
                    riverside,2024-06-11 12:00\n";

        let err =
            import_rows("history", &mapping(0.2), body, "riverside", RecordKind::Weather, fetched_at())
                .unwrap_err();
        assert!(matches!(err, FetchError::Format { .. }));
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let body = "city,date,temperature\nriverside,2024-06-11,20\n";
        let err =
            import_rows("history", &mapping(0.2), body, "riverside", RecordKind::Weather, fetched_at())
                .unwrap_err();
        let FetchError::Schema { message, .. } = err else {
            panic!("expected schema error");
        };
        assert!(message.contains("temp_c"));
    }

    #[test]
    fn test_semicolon_delimiter() {
        let mut mapping = mapping(0.0);
        mapping.delimiter = ';';
        mapping.subject_column = None;
        let body = "date;temp_c;sky\n2024-06-11T14:00;21.5;clear\n";

        let import =
            import_rows("history", &mapping, body, "riverside", RecordKind::Weather, fetched_at()).unwrap();
        assert_eq!(import.records.len(), 1);
        assert_eq!(import.records[0].subject, "riverside");
        assert_eq!(import.records[0].fields["temperature"].as_number(), Some(21.5));
    }
}
