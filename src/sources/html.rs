//! HTML-scrape adapter
//!
//! Pages are parsed with `scraper` and read through CSS selectors. With a
//! `row_selector` every matching element becomes one record (hourly forecast
//! tables, departure boards); otherwise the page is a single record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::http::get_text;
use super::values::{convert, parse_timestamp};
use super::{FetchError, SourceAdapter, log_content_error, render_access_point};
use crate::locations::LocationDirectory;
use crate::models::{HtmlField, HtmlMapping, Record, RecordKind, SourceDescriptor, SourceMapping};

pub struct HtmlSource {
    descriptor: SourceDescriptor,
    client: Client,
    locations: Option<Arc<LocationDirectory>>,
}

impl HtmlSource {
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

    fn mapping(&self) -> Result<&HtmlMapping, FetchError> {
        match &self.descriptor.mapping {
            SourceMapping::Html(mapping) => Ok(mapping),
            other => Err(FetchError::format(
                &self.descriptor.id,
                format!("expected an html mapping, found {}", other.format_name()),
            )),
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlSource {
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

        let parser = PageParser {
            source_id: &self.descriptor.id,
            mapping,
            subject,
            kind,
            fetched_at: Utc::now(),
        };
        let records = parser.parse(&body).inspect_err(log_content_error)?;
        debug!(count = records.len(), "Scraped records");
        Ok(records)
    }
}

/// Extracts records from one page according to an [`HtmlMapping`]
pub struct PageParser<'a> {
    pub source_id: &'a str,
    pub mapping: &'a HtmlMapping,
    pub subject: &'a str,
    pub kind: RecordKind,
    pub fetched_at: DateTime<Utc>,
}

impl PageParser<'_> {
    pub fn parse(&self, body: &str) -> Result<Vec<Record>, FetchError> {
        let document = Html::parse_document(body);

        let fields = self
            .mapping
            .fields
            .iter()
            .map(|(name, field)| Ok((name.as_str(), field, self.compile(&field.selector)?)))
            .collect::<Result<Vec<_>, FetchError>>()?;
        let time_selector = self
            .mapping
            .time_selector
            .as_deref()
            .map(|css| self.compile(css))
            .transpose()?;

        let rows: Vec<ElementRef> = match &self.mapping.row_selector {
            Some(css) => {
                let selector = self.compile(css)?;
                let rows: Vec<_> = document.select(&selector).collect();
                if rows.is_empty() {
                    return Err(FetchError::parse(
                        self.source_id,
                        format!("row selector '{css}' matched nothing"),
                        body,
                    ));
                }
                rows
            }
            None => vec![document.root_element()],
        };

        rows.into_iter()
            .map(|row| self.extract(row, &fields, time_selector.as_ref(), body))
            .collect()
    }

    fn compile(&self, css: &str) -> Result<Selector, FetchError> {
        Selector::parse(css).map_err(|e| {
            FetchError::format(self.source_id, format!("invalid selector '{css}': {e}"))
        })
    }

    fn extract(
        &self,
        row: ElementRef,
        fields: &[(&str, &HtmlField, Selector)],
        time_selector: Option<&Selector>,
        body: &str,
    ) -> Result<Record, FetchError> {
        let observed_at = match time_selector {
            Some(selector) => {
                let raw = row
                    .select(selector)
                    .next()
                    .map(|el| {
                        el.value()
                            .attr("datetime")
                            .map_or_else(|| el.text().collect::<String>(), str::to_string)
                    })
                    .ok_or_else(|| FetchError::parse(self.source_id, "time anchor missing", body))?;
                parse_timestamp(&raw, self.mapping.time_format.as_deref()).ok_or_else(|| {
                    FetchError::parse(self.source_id, format!("unreadable time '{}'", raw.trim()), body)
                })?
            }
            None => self.fetched_at,
        };

        let mut record = Record::new(
            self.subject,
            self.kind,
            self.source_id,
            observed_at,
            self.fetched_at,
        );

        for (name, field, selector) in fields {
            let value = first_value(row, selector, field.attribute.as_deref()).and_then(|raw| {
                convert(
                    &raw,
                    field.value_type,
                    self.mapping.time_format.as_deref(),
                    self.mapping.thousands_separator.as_deref(),
                )
            });
            match value {
                Some(value) => {
                    record.fields.insert((*name).to_string(), value);
                }
                None if field.optional => {}
                None => {
                    return Err(FetchError::parse(
                        self.source_id,
                        format!("anchor '{}' for '{name}' missing or unreadable", field.selector),
                        body,
                    ));
                }
            }
        }

        Ok(record)
    }
}

fn first_value(scope: ElementRef, selector: &Selector, attribute: Option<&str>) -> Option<String> {
    let element = scope.select(selector).next()?;
    match attribute {
        Some(attr) => element.value().attr(attr).map(str::to_string),
        None => Some(element.text().collect()),
    }
}
