//! Error types and handling for the WeatherTravel engine

use thiserror::Error;

use crate::cache::CacheError;
use crate::engine::AggregationError;
use crate::sources::FetchError;

/// Main error type of the crate
#[derive(Error, Debug)]
pub enum WeatherTravelError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Input validation errors
    #[error("Invalid input: {message}")]
    Validation { message: String },

    /// Cache store errors
    #[error("Cache error: {source}")]
    Cache {
        #[from]
        source: CacheError,
    },

    /// A single source failed outside of an aggregated query
    #[error("Fetch error: {source}")]
    Fetch {
        #[from]
        source: FetchError,
    },

    /// Every source failed and nothing was cached
    #[error("{source}")]
    Aggregation {
        #[from]
        source: AggregationError,
    },

    /// I/O operation errors
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl WeatherTravelError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Get a user-friendly error message
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            WeatherTravelError::Config { .. } => {
                "Configuration error. Please check your config file and source definitions."
                    .to_string()
            }
            WeatherTravelError::Validation { message } => {
                format!("Invalid input: {message}")
            }
            WeatherTravelError::Cache { .. } => {
                "Cache operation failed. You may need to clear your cache.".to_string()
            }
            WeatherTravelError::Fetch { .. } | WeatherTravelError::Aggregation { .. } => {
                "Unable to get data from any source. Please check your internet connection."
                    .to_string()
            }
            WeatherTravelError::Io { .. } => {
                "File operation failed. Please check file permissions.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use crate::sources::SourceFailure;

    #[test]
    fn test_error_creation() {
        let config_err = WeatherTravelError::config("missing sources");
        assert!(matches!(config_err, WeatherTravelError::Config { .. }));

        let validation_err = WeatherTravelError::validation("empty subject");
        assert!(matches!(validation_err, WeatherTravelError::Validation { .. }));
    }

    #[test]
    fn test_user_messages() {
        let config_err = WeatherTravelError::config("test");
        assert!(config_err.user_message().contains("Configuration error"));

        let validation_err = WeatherTravelError::validation("test input");
        assert!(validation_err.user_message().contains("test input"));

        let aggregation: WeatherTravelError = AggregationError::AllSourcesFailed {
            subject: "riverside".to_string(),
            kind: RecordKind::Weather,
            failures: vec![SourceFailure::new(
                "a",
                FetchError::network("a", "connection refused"),
            )],
        }
        .into();
        assert!(aggregation.user_message().contains("Unable to get data"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: WeatherTravelError = io_err.into();
        assert!(matches!(err, WeatherTravelError::Io { .. }));
    }
}
