//! Data models for the WeatherTravel engine
//!
//! This module contains the core domain models organized by concern:
//! - Record: normalized observations and their typed values
//! - Cache entry: cache keys, time buckets and freshness
//! - Source: per-source descriptors and extraction mappings
//! - Location: known places from the location directory
//! - Units: display conversions

pub mod cache_entry;
pub mod location;
pub mod record;
pub mod source;
pub mod units;

// Re-export all public types for convenient access
pub use cache_entry::{CacheEntry, CacheKey, Freshness, TimeBucket};
pub use location::Location;
pub use record::{FieldValue, Record, RecordKind, normalize_subject};
pub use source::{
    CsvField, CsvMapping, HtmlField, HtmlMapping, JsonMapping, RateLimitPolicy, SourceDescriptor,
    SourceMapping, ValueType,
};
pub use units::UnitSystem;
