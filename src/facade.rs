//! Query facade, the entry point for front ends
//!
//! Validates requests, runs them through the aggregation engine and shapes
//! snapshots into display views.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::engine::{AggregationEngine, Snapshot};
use crate::error::WeatherTravelError;
use crate::locations::LocationDirectory;
use crate::models::units::{to_imperial, wind_direction_to_cardinal};
use crate::models::{FieldValue, Freshness, Location, RecordKind, UnitSystem, normalize_subject};
use crate::scheduler::FetchScheduler;
use crate::scoring::WeatherEvaluation;
use crate::sources::{build_adapter, http::build_client};

const MAX_SUBJECT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Fresh,
    Stale,
    Degraded,
}

/// One attribute ready for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeView {
    pub name: String,
    pub value: FieldValue,
    pub display: String,
    /// Source whose value was kept
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailingSource {
    pub source_id: String,
    pub reason: String,
}

/// Display shape of one answered query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryView {
    pub subject: String,
    pub kind: RecordKind,
    pub bucket: DateTime<Utc>,
    pub observed_at: Option<DateTime<Utc>>,
    pub status: QueryStatus,
    /// Sorted by name
    pub attributes: Vec<AttributeView>,
    pub sources: Vec<String>,
    pub failing_sources: Vec<FailingSource>,
    pub from_cache: bool,
    /// Travel rating, present when any road-relevant attribute was merged
    pub evaluation: Option<WeatherEvaluation>,
}

impl QueryView {
    pub fn from_snapshot(snapshot: &Snapshot, units: UnitSystem) -> Self {
        let status = if snapshot.degraded {
            QueryStatus::Degraded
        } else if snapshot.freshness == Freshness::Fresh {
            QueryStatus::Fresh
        } else {
            QueryStatus::Stale
        };

        let evaluation = snapshot
            .merged
            .as_ref()
            .and_then(|merged| WeatherEvaluation::from_fields(&merged.fields));
        let (attributes, sources, observed_at) = match &snapshot.merged {
            Some(merged) => {
                let mut attributes: Vec<AttributeView> = merged
                    .fields
                    .iter()
                    .map(|(name, value)| {
                        let source = merged.provenance.get(name).cloned().unwrap_or_default();
                        shape_attribute(name, value, source, units)
                    })
                    .collect();
                attributes.sort_by(|a, b| a.name.cmp(&b.name));
                (attributes, merged.sources.clone(), Some(merged.observed_at))
            }
            None => (Vec::new(), Vec::new(), None),
        };

        Self {
            subject: snapshot.key.subject.clone(),
            kind: snapshot.key.kind,
            bucket: snapshot.key.bucket.start(),
            observed_at,
            status,
            attributes,
            sources,
            failing_sources: snapshot
                .failures
                .iter()
                .map(|f| FailingSource {
                    source_id: f.source_id.clone(),
                    reason: f.error.to_string(),
                })
                .collect(),
            from_cache: snapshot.origin == crate::engine::SnapshotOrigin::Cache,
            evaluation,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeView> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

fn shape_attribute(name: &str, value: &FieldValue, source: String, units: UnitSystem) -> AttributeView {
    if let FieldValue::Number(n) = value {
        if is_wind_direction(name) {
            return AttributeView {
                name: name.to_string(),
                value: value.clone(),
                display: format!("{}° {}", format_number(*n), wind_direction_to_cardinal(*n)),
                source,
            };
        }
        if units == UnitSystem::Imperial
            && let Some((converted_name, converted)) = to_imperial(name, *n)
        {
            return AttributeView {
                name: converted_name,
                value: FieldValue::Number(converted),
                display: format_number(converted),
                source,
            };
        }
    }

    let display = match value {
        FieldValue::Number(n) => format_number(*n),
        FieldValue::Text(t) => t.clone(),
        FieldValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M UTC").to_string(),
    };
    AttributeView {
        name: name.to_string(),
        value: value.clone(),
        display,
        source,
    }
}

fn is_wind_direction(name: &str) -> bool {
    name.ends_with("wind_direction") || name.ends_with("wind_direction_deg")
}

/// At most two decimals, trailing zeros dropped
fn format_number(n: f64) -> String {
    let formatted = format!("{n:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Trim, case-fold and check a raw request
pub fn validate_request(subject: &str, kind: &str) -> Result<(String, RecordKind), WeatherTravelError> {
    let subject = normalize_subject(subject);
    if subject.is_empty() {
        return Err(WeatherTravelError::validation("subject cannot be empty"));
    }
    if subject.chars().count() > MAX_SUBJECT_CHARS {
        return Err(WeatherTravelError::validation(format!(
            "subject is longer than {MAX_SUBJECT_CHARS} characters"
        )));
    }
    let kind: RecordKind = kind.trim().parse()?;
    Ok((subject, kind))
}

pub struct QueryFacade {
    engine: AggregationEngine,
    units: UnitSystem,
    locations: Option<Arc<LocationDirectory>>,
}

impl QueryFacade {
    pub fn new(
        engine: AggregationEngine,
        units: UnitSystem,
        locations: Option<Arc<LocationDirectory>>,
    ) -> Self {
        Self {
            engine,
            units,
            locations,
        }
    }

    /// Open the cache, load locations and build one adapter per configured source
    pub async fn from_config(config: &AppConfig) -> Result<Self, WeatherTravelError> {
        let locations = match &config.locations {
            Some(locations) => Some(Arc::new(LocationDirectory::load(&locations.csv_path).await?)),
            None => None,
        };

        let cache = Arc::new(CacheStore::open(config.cache_dir(), config.cache_settings()).await?);

        let client = build_client(&config.http.user_agent, config.http_timeout())
            .map_err(|e| WeatherTravelError::config(format!("cannot build HTTP client: {e}")))?;
        let adapters = config
            .sources
            .iter()
            .map(|descriptor| build_adapter(descriptor.clone(), client.clone(), locations.clone()))
            .collect();
        let scheduler = FetchScheduler::new(&config.sources, config.scheduler_settings());

        let engine = AggregationEngine::new(adapters, cache, scheduler, config.engine_settings());
        info!(
            sources = config.sources.len(),
            cache = %config.cache_dir().display(),
            "Query facade ready"
        );

        Ok(Self::new(engine, config.display.units, locations))
    }

    #[must_use]
    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    #[must_use]
    pub fn units(&self) -> UnitSystem {
        self.units
    }

    pub async fn query(&self, subject: &str, kind: &str) -> Result<QueryView, WeatherTravelError> {
        self.query_at(subject, kind, Utc::now()).await
    }

    /// Answer for the time bucket containing `at`
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn query_at(
        &self,
        subject: &str,
        kind: &str,
        at: DateTime<Utc>,
    ) -> Result<QueryView, WeatherTravelError> {
        let (subject, kind) = validate_request(subject, kind)?;
        let snapshot = self.engine.query_at(&subject, kind, at).await?;
        Ok(QueryView::from_snapshot(&snapshot, self.units))
    }

    /// Validates every request before any fetch; one invalid request fails the batch
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub async fn bulk_query(
        &self,
        requests: &[(String, String)],
    ) -> Result<BTreeMap<(String, RecordKind), Result<QueryView, WeatherTravelError>>, WeatherTravelError>
    {
        let validated = requests
            .iter()
            .map(|(subject, kind)| validate_request(subject, kind))
            .collect::<Result<Vec<_>, _>>()?;

        let results = self.engine.bulk_query(&validated).await;
        Ok(results
            .into_iter()
            .map(|(key, result)| {
                let view = result
                    .map(|snapshot| QueryView::from_snapshot(&snapshot, self.units))
                    .map_err(WeatherTravelError::from);
                (key, view)
            })
            .collect())
    }

    /// Empty when no location directory is configured
    pub fn search_locations(&self, text: &str, limit: usize) -> Vec<Location> {
        self.locations
            .as_ref()
            .map(|dir| dir.search(text, limit).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop entries past their grace window, returning how many were removed
    pub async fn evict_expired(&self) -> Result<usize, WeatherTravelError> {
        let cache = self.engine.cache();
        Ok(cache.evict_expired(cache.settings().grace).await?)
    }

    /// Cancel fetches in progress and close the cache
    pub fn close(&self) {
        self.engine.shutdown();
        self.engine.cache().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::engine::EngineSettings;
    use crate::models::{JsonMapping, RateLimitPolicy, Record, SourceDescriptor, SourceMapping};
    use crate::scheduler::SchedulerSettings;
    use crate::sources::{FetchError, SourceAdapter};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rstest::rstest;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct StaticSource {
        descriptor: SourceDescriptor,
        fields: Vec<(&'static str, FieldValue)>,
        fail: bool,
    }

    #[async_trait]
    impl SourceAdapter for StaticSource {
        fn descriptor(&self) -> &SourceDescriptor {
            &self.descriptor
        }

        async fn fetch(
            &self,
            subject: &str,
            kind: RecordKind,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Record>, FetchError> {
            if self.fail {
                return Err(FetchError::format(&self.descriptor.id, "page layout changed"));
            }
            let record = self.fields.iter().fold(
                Record::new(subject, kind, &self.descriptor.id, noon(), Utc::now()),
                |record, (name, value)| record.with_field(name, value.clone()),
            );
            Ok(vec![record])
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap()
    }

    fn descriptor(id: &str, trust_priority: i32) -> SourceDescriptor {
        SourceDescriptor {
            id: id.to_string(),
            access_point: format!("https://{id}.example.com/{{subject}}"),
            rate_limit: RateLimitPolicy::default(),
            trust_priority,
            ttl_minutes: None,
            kinds: vec![RecordKind::Weather],
            mapping: SourceMapping::Json(JsonMapping {
                time: "time".to_string(),
                time_format: None,
                fields: BTreeMap::new(),
            }),
        }
    }

    async fn facade(dir: &TempDir, sources: Vec<StaticSource>, units: UnitSystem) -> QueryFacade {
        let descriptors: Vec<SourceDescriptor> = sources.iter().map(|s| s.descriptor.clone()).collect();
        let adapters = sources
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn SourceAdapter>)
            .collect();
        let cache = Arc::new(CacheStore::open(dir.path(), CacheSettings::default()).await.unwrap());
        let scheduler = FetchScheduler::new(&descriptors, SchedulerSettings::default());
        let engine = AggregationEngine::new(adapters, cache, scheduler, EngineSettings::default());
        QueryFacade::new(engine, units, None)
    }

    fn weather_source() -> StaticSource {
        StaticSource {
            descriptor: descriptor("meteo", 10),
            fields: vec![
                ("temperature_c", FieldValue::Number(21.0)),
                ("wind_speed_kmh", FieldValue::Number(12.5)),
                ("wind_direction_deg", FieldValue::Number(225.0)),
                ("conditions", FieldValue::from("Sunny")),
            ],
            fail: false,
        }
    }

    #[rstest]
    #[case("  Riverside ", "weather", "riverside", RecordKind::Weather)]
    #[case("NEW YORK", " Travel ", "new york", RecordKind::Travel)]
    fn test_validate_request_normalizes(
        #[case] subject: &str,
        #[case] kind: &str,
        #[case] expected_subject: &str,
        #[case] expected_kind: RecordKind,
    ) {
        let (subject, kind) = validate_request(subject, kind).unwrap();
        assert_eq!(subject, expected_subject);
        assert_eq!(kind, expected_kind);
    }

    #[rstest]
    #[case("   ", "weather")]
    #[case("riverside", "traffic")]
    fn test_validate_request_rejects(#[case] subject: &str, #[case] kind: &str) {
        assert!(matches!(
            validate_request(subject, kind),
            Err(WeatherTravelError::Validation { .. })
        ));
    }

    #[rstest]
    #[case(21.0, "21")]
    #[case(12.5, "12.5")]
    #[case(69.800_000_1, "69.8")]
    #[case(-0.001, "0")]
    fn test_format_number(#[case] n: f64, #[case] expected: &str) {
        assert_eq!(format_number(n), expected);
    }

    #[tokio::test]
    async fn test_metric_view() {
        let dir = TempDir::new().unwrap();
        let facade = facade(&dir, vec![weather_source()], UnitSystem::Metric).await;

        let view = facade.query_at(" Riverside", "weather", noon()).await.unwrap();
        assert_eq!(view.subject, "riverside");
        assert_eq!(view.status, QueryStatus::Fresh);
        assert!(!view.from_cache);

        let names: Vec<&str> = view.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["conditions", "temperature_c", "wind_direction_deg", "wind_speed_kmh"]
        );
        assert_eq!(view.attribute("wind_direction_deg").unwrap().display, "225° SW");
        assert_eq!(view.attribute("temperature_c").unwrap().source, "meteo");

        let again = facade.query_at("riverside", "weather", noon()).await.unwrap();
        assert!(again.from_cache);
        assert_eq!(again.attributes, view.attributes);
    }

    #[tokio::test]
    async fn test_imperial_view_converts_by_suffix() {
        let dir = TempDir::new().unwrap();
        let facade = facade(&dir, vec![weather_source()], UnitSystem::Imperial).await;

        let view = facade.query_at("riverside", "weather", noon()).await.unwrap();
        assert_eq!(view.attribute("temperature_f").unwrap().display, "69.8");
        assert_eq!(view.attribute("wind_speed_mph").unwrap().display, "7.77");
        assert!(view.attribute("temperature_c").is_none());
        assert_eq!(view.attribute("conditions").unwrap().display, "Sunny");
    }

    #[tokio::test]
    async fn test_partial_failure_lists_failing_source() {
        let dir = TempDir::new().unwrap();
        let broken = StaticSource {
            descriptor: descriptor("scraper", 20),
            fields: Vec::new(),
            fail: true,
        };
        let facade = facade(&dir, vec![weather_source(), broken], UnitSystem::Metric).await;

        let view = facade.query_at("riverside", "weather", noon()).await.unwrap();
        assert_eq!(view.status, QueryStatus::Fresh);
        assert_eq!(view.sources, vec!["meteo"]);
        assert_eq!(view.failing_sources.len(), 1);
        assert_eq!(view.failing_sources[0].source_id, "scraper");
        assert!(view.failing_sources[0].reason.contains("page layout changed"));
    }

    #[tokio::test]
    async fn test_bulk_query_validates_first() {
        let dir = TempDir::new().unwrap();
        let facade = facade(&dir, vec![weather_source()], UnitSystem::Metric).await;

        let invalid = vec![
            ("riverside".to_string(), "weather".to_string()),
            (String::new(), "weather".to_string()),
        ];
        assert!(facade.bulk_query(&invalid).await.is_err());
        assert!(facade.engine().cache().is_empty().await);

        let requests = vec![
            ("riverside".to_string(), "weather".to_string()),
            ("Riverside ".to_string(), "WEATHER".to_string()),
            ("hillview".to_string(), "weather".to_string()),
        ];
        let results = facade.bulk_query(&requests).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[&("riverside".to_string(), RecordKind::Weather)].is_ok());
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_an_error() {
        let dir = TempDir::new().unwrap();
        let facade = facade(&dir, vec![weather_source()], UnitSystem::Metric).await;

        let err = facade.query("riverside", "travel").await.unwrap_err();
        assert!(matches!(err, WeatherTravelError::Aggregation { .. }));
    }

    #[tokio::test]
    async fn test_travel_view_carries_weather_evaluation() {
        let dir = TempDir::new().unwrap();
        let mut road = descriptor("road", 5);
        road.kinds = vec![RecordKind::Travel];
        let road = StaticSource {
            descriptor: road,
            fields: vec![
                ("precipitation_mm", FieldValue::Number(4.0)),
                ("wind_gust_kmh", FieldValue::Number(12.0)),
            ],
            fail: false,
        };
        let facade = facade(&dir, vec![weather_source(), road], UnitSystem::Imperial).await;

        let travel = facade.query_at("milan", "travel", noon()).await.unwrap();
        let evaluation = travel.evaluation.as_ref().unwrap();
        assert_eq!(evaluation.score, 58);
        assert_eq!(evaluation.category, crate::scoring::ScoreCategory::Good);
        assert_eq!(evaluation.conditions.len(), 2);
        assert!(travel.attribute("precipitation_inch").is_some());

        let weather = facade.query_at("riverside", "weather", noon()).await.unwrap();
        assert!(weather.evaluation.is_none());
    }

    #[tokio::test]
    async fn test_search_without_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let facade = facade(&dir, vec![weather_source()], UnitSystem::Metric).await;
        assert!(facade.search_locations("paris", 10).is_empty());

        facade.close();
        assert!(facade.engine().cache().is_closed());
    }
}
