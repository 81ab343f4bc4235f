//! Configuration management for `weathertravel`
//!
//! Handles loading configuration from files, environment variables,
//! and provides validation for all configuration settings, including the
//! per-source descriptors.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheSettings;
use crate::engine::EngineSettings;
use crate::error::WeatherTravelError;
use crate::models::{SourceDescriptor, SourceMapping, UnitSystem};
use crate::scheduler::SchedulerSettings;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    /// World-cities file used for `{lat}`/`{lng}` templates and location search
    #[serde(default)]
    pub locations: Option<LocationsConfig>,
    /// External sources in declaration order
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

/// Cache configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory location
    #[serde(default = "default_cache_location")]
    pub location: String,
    /// Time bucket granularity in minutes
    #[serde(default = "default_bucket_minutes")]
    pub bucket_minutes: u64,
    /// How long expired entries remain usable as stale, in hours
    #[serde(default = "default_grace_hours")]
    pub grace_hours: u64,
    #[serde(default = "default_weather_ttl")]
    pub weather_ttl_minutes: u64,
    #[serde(default = "default_travel_ttl")]
    pub travel_ttl_minutes: u64,
    /// Random TTL spread as a fraction, 0 disables it
    #[serde(default)]
    pub ttl_jitter: f64,
}

/// Aggregation engine and fetch scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for all source fetches of one query
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_fetches: usize,
    /// Longest wait for a rate-limit slot before giving up on a source
    #[serde(default = "default_admission_timeout")]
    pub admission_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_min")]
    pub retry_min_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
    #[serde(default)]
    pub serve_stale_while_refresh: bool,
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty or json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// OTLP/HTTP collector endpoint; spans are exported when set
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub units: UnitSystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationsConfig {
    pub csv_path: String,
}

// Default value functions
fn default_cache_location() -> String {
    "~/.cache/weathertravel".to_string()
}

fn default_bucket_minutes() -> u64 {
    60
}

fn default_grace_hours() -> u64 {
    6
}

fn default_weather_ttl() -> u64 {
    30
}

fn default_travel_ttl() -> u64 {
    360
}

fn default_query_timeout() -> u64 {
    5000
}

fn default_max_in_flight() -> usize {
    8
}

fn default_admission_timeout() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_min() -> u64 {
    200
}

fn default_retry_max() -> u64 {
    5000
}

fn default_user_agent() -> String {
    format!("weathertravel/{}", env!("CARGO_PKG_VERSION"))
}

fn default_http_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            location: default_cache_location(),
            bucket_minutes: default_bucket_minutes(),
            grace_hours: default_grace_hours(),
            weather_ttl_minutes: default_weather_ttl(),
            travel_ttl_minutes: default_travel_ttl(),
            ttl_jitter: 0.0,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout(),
            max_in_flight_fetches: default_max_in_flight(),
            admission_timeout_ms: default_admission_timeout(),
            max_retries: default_max_retries(),
            retry_min_ms: default_retry_min(),
            retry_max_ms: default_retry_max(),
            serve_stale_while_refresh: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_seconds: default_http_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            otlp_endpoint: None,
        }
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
const VALID_LOG_FORMATS: [&str; 2] = ["pretty", "json"];

impl AppConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path(None)
    }

    /// Load configuration from specified path, then environment overrides
    pub fn load_from_path(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_file = config_path.unwrap_or_else(|| {
            Self::get_config_path().unwrap_or_else(|| PathBuf::from("config.toml"))
        });

        if config_file.exists() {
            builder = builder.add_source(
                File::from(config_file.clone())
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        // WEATHERTRAVEL_ENGINE__MAX_RETRIES=3 etc.
        builder = builder.add_source(
            Environment::with_prefix("WEATHERTRAVEL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .with_context(|| format!("Failed to build configuration from {}", config_file.display()))?;

        Self::finish(settings)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .with_context(|| "Failed to parse configuration")?;

        Self::finish(settings)
    }

    fn finish(settings: Config) -> Result<Self> {
        let mut config: AppConfig = settings
            .try_deserialize()
            .with_context(|| "Failed to deserialize configuration")?;

        config.apply_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path
    #[must_use]
    pub fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("weathertravel").join("config.toml"))
    }

    /// Apply default values to zeroed configuration fields
    pub fn apply_defaults(&mut self) {
        if self.cache.location.is_empty() {
            self.cache.location = default_cache_location();
        }
        if self.cache.bucket_minutes == 0 {
            self.cache.bucket_minutes = default_bucket_minutes();
        }
        if self.cache.weather_ttl_minutes == 0 {
            self.cache.weather_ttl_minutes = default_weather_ttl();
        }
        if self.cache.travel_ttl_minutes == 0 {
            self.cache.travel_ttl_minutes = default_travel_ttl();
        }
        if self.engine.query_timeout_ms == 0 {
            self.engine.query_timeout_ms = default_query_timeout();
        }
        if self.engine.max_in_flight_fetches == 0 {
            self.engine.max_in_flight_fetches = default_max_in_flight();
        }
        if self.engine.admission_timeout_ms == 0 {
            self.engine.admission_timeout_ms = default_admission_timeout();
        }
        if self.http.user_agent.is_empty() {
            self.http.user_agent = default_user_agent();
        }
        if self.http.timeout_seconds == 0 {
            self.http.timeout_seconds = default_http_timeout();
        }
        if self.logging.level.is_empty() {
            self.logging.level = default_log_level();
        }
        if self.logging.format.is_empty() {
            self.logging.format = default_log_format();
        }
    }

    /// Validate all configuration settings
    pub fn validate(&self) -> Result<()> {
        self.validate_numeric_ranges()?;
        self.validate_string_values()?;
        self.validate_sources()?;
        Ok(())
    }

    fn validate_numeric_ranges(&self) -> Result<()> {
        if self.cache.bucket_minutes > 24 * 60 {
            return Err(WeatherTravelError::config("Cache bucket cannot exceed 1440 minutes (1 day)").into());
        }

        if !(0.0..=0.5).contains(&self.cache.ttl_jitter) {
            return Err(WeatherTravelError::config("Cache TTL jitter must be between 0.0 and 0.5").into());
        }

        if self.engine.query_timeout_ms > 300_000 {
            return Err(WeatherTravelError::config("Query timeout cannot exceed 300000 ms").into());
        }

        if self.engine.max_retries > 10 {
            return Err(WeatherTravelError::config("Max retries cannot exceed 10").into());
        }

        if self.engine.retry_min_ms > self.engine.retry_max_ms {
            return Err(WeatherTravelError::config(format!(
                "retry_min_ms ({}) cannot exceed retry_max_ms ({})",
                self.engine.retry_min_ms, self.engine.retry_max_ms
            ))
            .into());
        }

        if self.http.timeout_seconds > 300 {
            return Err(WeatherTravelError::config("HTTP timeout cannot exceed 300 seconds").into());
        }

        Ok(())
    }

    fn validate_string_values(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(WeatherTravelError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ))
            .into());
        }

        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(WeatherTravelError::config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_LOG_FORMATS.join(", ")
            ))
            .into());
        }

        if let Some(endpoint) = &self.logging.otlp_endpoint
            && !is_http_url(endpoint)
        {
            return Err(WeatherTravelError::config("OTLP endpoint must be a valid HTTP or HTTPS URL").into());
        }

        Ok(())
    }

    fn validate_sources(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(WeatherTravelError::config("Source id cannot be empty").into());
            }
            if !seen.insert(source.id.as_str()) {
                return Err(WeatherTravelError::config(format!("Duplicate source id '{}'", source.id)).into());
            }
            validate_source(source)
                .with_context(|| format!("Invalid source '{}'", source.id))?;
        }
        Ok(())
    }

    /// Cache directory with a leading `~` expanded
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        expand_home(&self.cache.location)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_seconds)
    }

    #[must_use]
    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            bucket: minutes(self.cache.bucket_minutes),
            grace: minutes(self.cache.grace_hours * 60),
            weather_ttl: minutes(self.cache.weather_ttl_minutes),
            travel_ttl: minutes(self.cache.travel_ttl_minutes),
            ttl_jitter: self.cache.ttl_jitter,
            source_ttls: self
                .sources
                .iter()
                .filter_map(|s| s.ttl().map(|ttl| (s.id.clone(), ttl)))
                .collect(),
        }
    }

    #[must_use]
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            admission_timeout: Duration::from_millis(self.engine.admission_timeout_ms),
            max_retries: self.engine.max_retries,
            retry_min: Duration::from_millis(self.engine.retry_min_ms),
            retry_max: Duration::from_millis(self.engine.retry_max_ms),
        }
    }

    #[must_use]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            query_timeout: Duration::from_millis(self.engine.query_timeout_ms),
            max_in_flight_fetches: self.engine.max_in_flight_fetches,
            serve_stale_while_refresh: self.engine.serve_stale_while_refresh,
        }
    }
}

fn validate_source(source: &SourceDescriptor) -> Result<()> {
    if source.kinds.is_empty() {
        return Err(WeatherTravelError::config("at least one kind is required").into());
    }
    if source.rate_limit.capacity == 0 {
        return Err(WeatherTravelError::config("rate_limit.capacity must be positive").into());
    }
    if source.rate_limit.refill_interval_ms == 0 {
        return Err(WeatherTravelError::config("rate_limit.refill_interval_ms must be positive").into());
    }
    if source.access_point.trim().is_empty() {
        return Err(WeatherTravelError::config("access_point cannot be empty").into());
    }

    match &source.mapping {
        SourceMapping::Html(mapping) => {
            if !is_http_url(&source.access_point) {
                return Err(WeatherTravelError::config("HTML sources need an HTTP or HTTPS access point").into());
            }
            let selectors = mapping
                .row_selector
                .iter()
                .chain(mapping.time_selector.iter())
                .chain(mapping.fields.values().map(|f| &f.selector));
            for selector in selectors {
                scraper::Selector::parse(selector).map_err(|e| {
                    WeatherTravelError::config(format!("invalid selector '{selector}': {e}"))
                })?;
            }
        }
        SourceMapping::Json(mapping) => {
            if !is_http_url(&source.access_point) {
                return Err(WeatherTravelError::config("JSON sources need an HTTP or HTTPS access point").into());
            }
            if mapping.time.trim().is_empty() {
                return Err(WeatherTravelError::config("JSON mapping needs a time path").into());
            }
        }
        SourceMapping::Csv(mapping) => {
            if !mapping.delimiter.is_ascii() {
                return Err(WeatherTravelError::config(format!(
                    "CSV delimiter '{}' is not an ASCII character",
                    mapping.delimiter
                ))
                .into());
            }
            if !(0.0..=1.0).contains(&mapping.max_skip_ratio) {
                return Err(WeatherTravelError::config("max_skip_ratio must be between 0.0 and 1.0").into());
            }
        }
    }

    Ok(())
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value * 60)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use std::env;

    const SAMPLE: &str = r#"
        [cache]
        location = "/tmp/weathertravel-cache"
        weather_ttl_minutes = 15

        [engine]
        query_timeout_ms = 2500
        max_retries = 0

        [display]
        units = "imperial"

        [[sources]]
        id = "open-meteo"
        access_point = "https://api.example.com/forecast?latitude={lat}&longitude={lng}"
        trust_priority = 10
        ttl_minutes = 20
        kinds = ["weather"]

        [sources.rate_limit]
        capacity = 5
        refill_interval_ms = 200

        [sources.mapping.json]
        time = "current.time"

        [sources.mapping.json.fields]
        temperature_c = "current.temperature_2m"

        [[sources]]
        id = "timetable"
        access_point = "data/{subject}.csv"
        kinds = ["travel"]

        [sources.mapping.csv]
        time_column = "departure"
        delimiter = ";"

        [sources.mapping.csv.fields.price]
        column = "price_eur"
    "#;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.cache.bucket_minutes, 60);
        assert_eq!(config.engine.query_timeout_ms, 5000);
        assert_eq!(config.engine.max_retries, 2);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.display.units, UnitSystem::Metric);
        assert!(config.sources.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sources_from_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.display.units, UnitSystem::Imperial);
        assert_eq!(config.engine.max_retries, 0);
        assert_eq!(config.engine.retry_max_ms, 5000);

        let meteo = &config.sources[0];
        assert_eq!(meteo.rate_limit.capacity, 5);
        assert!(meteo.supports(RecordKind::Weather));
        assert_eq!(meteo.mapping.format_name(), "json");

        let timetable = &config.sources[1];
        assert_eq!(timetable.rate_limit.capacity, 2);
        match &timetable.mapping {
            SourceMapping::Csv(mapping) => assert_eq!(mapping.delimiter, ';'),
            other => panic!("unexpected mapping {other:?}"),
        }

        let cache = config.cache_settings();
        assert_eq!(cache.weather_ttl, Duration::from_secs(15 * 60));
        assert_eq!(cache.source_ttls["open-meteo"], Duration::from_secs(20 * 60));
        assert!(!cache.source_ttls.contains_key("timetable"));
        assert_eq!(config.engine_settings().query_timeout, Duration::from_millis(2500));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/weathertravel-cache"));
    }

    #[test]
    fn test_apply_defaults_fills_zeroes() {
        let mut config = AppConfig::default();
        config.cache.bucket_minutes = 0;
        config.logging.level = String::new();
        config.apply_defaults();
        assert_eq!(config.cache.bucket_minutes, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "invalid".to_string();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_config_validation_retry_bounds() {
        let mut config = AppConfig::default();
        config.engine.retry_min_ms = 10_000;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("retry_min_ms"));
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        config.sources[1].id = "open-meteo".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate source id"));
    }

    #[test]
    fn test_source_rules() {
        let base = AppConfig::from_toml_str(SAMPLE).unwrap();

        let mut config = base.clone();
        config.sources[0].kinds.clear();
        assert!(format!("{:#}", config.validate().unwrap_err()).contains("at least one kind"));

        let mut config = base.clone();
        config.sources[0].rate_limit.capacity = 0;
        assert!(format!("{:#}", config.validate().unwrap_err()).contains("capacity"));

        let mut config = base.clone();
        config.sources[0].access_point = "api.example.com/forecast".to_string();
        assert!(format!("{:#}", config.validate().unwrap_err()).contains("HTTP or HTTPS"));

        let mut config = base;
        if let SourceMapping::Csv(mapping) = &mut config.sources[1].mapping {
            mapping.delimiter = '§';
        }
        assert!(format!("{:#}", config.validate().unwrap_err()).contains("ASCII"));
    }

    #[test]
    fn test_invalid_html_selector_rejected() {
        let raw = r#"
            [[sources]]
            id = "forecast-page"
            access_point = "https://weather.example.com/{city_ascii}"
            kinds = ["weather"]

            [sources.mapping.html]
            row_selector = "table..rows"

            [sources.mapping.html.fields.temperature_c]
            selector = "td.temp"
        "#;
        let err = AppConfig::from_toml_str(raw).unwrap_err();
        assert!(format!("{err:#}").contains("invalid selector"));
    }

    #[test]
    fn test_environment_variable_override() {
        // SAFETY: Test environment, the variable is only read by this test
        unsafe {
            env::set_var("WEATHERTRAVEL_HTTP__TIMEOUT_SECONDS", "42");
        }

        let result = AppConfig::load_from_path(Some(PathBuf::from("/nonexistent/config.toml")));

        // SAFETY: Test cleanup
        unsafe {
            env::remove_var("WEATHERTRAVEL_HTTP__TIMEOUT_SECONDS");
        }

        let config = result.unwrap();
        assert_eq!(config.http.timeout_seconds, 42);
        assert_eq!(config.http_timeout(), Duration::from_secs(42));
    }

    #[test]
    fn test_config_path_generation() {
        let path = AppConfig::get_config_path().unwrap();
        assert!(path.to_string_lossy().contains("weathertravel"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
