//! `weathertravel` - Weather and travel data acquisition engine
//!
//! Fetches observations from heterogeneous external sources (HTML pages,
//! JSON APIs, CSV files), normalizes them into records, merges them by trust
//! priority and keeps them in a persistent, time-bucketed cache.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod locations;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod scoring;
pub mod sources;

// Re-export core types for public API
pub use cache::{CacheSettings, CacheStore};
pub use config::AppConfig;
pub use engine::{AggregationEngine, AggregationError, EngineSettings, MergedRecord, Snapshot};
pub use error::WeatherTravelError;
pub use facade::{QueryFacade, QueryStatus, QueryView};
pub use locations::LocationDirectory;
pub use models::{CacheEntry, CacheKey, FieldValue, Freshness, Location, Record, RecordKind};
pub use scheduler::{FetchScheduler, SchedulerSettings};
pub use scoring::{ScoreCategory, WeatherEvaluation};
pub use sources::{FetchError, SourceAdapter, SourceFailure};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Core result type used throughout the library
pub type Result<T> = std::result::Result<T, WeatherTravelError>;
