use thiserror::Error;

/// Failure of one source for one fetch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Network error from '{source_id}': {message}")]
    Network { source_id: String, message: String },

    #[error("HTTP status {status} from '{source_id}'")]
    HttpStatus { source_id: String, status: u16 },

    #[error("Parse error from '{source_id}': {message}")]
    Parse {
        source_id: String,
        message: String,
        excerpt: String,
    },

    #[error("Schema error from '{source_id}': {message}")]
    Schema {
        source_id: String,
        message: String,
        excerpt: String,
    },

    #[error("Format error from '{source_id}': {message}")]
    Format { source_id: String, message: String },

    #[error("Rate limit: '{source_id}' could not admit the request within {waited_ms} ms")]
    RateLimitTimeout { source_id: String, waited_ms: u64 },

    #[error("'{source_id}' did not answer within {after_ms} ms")]
    Timeout { source_id: String, after_ms: u64 },

    #[error("Fetch from '{source_id}' was cancelled")]
    Cancelled { source_id: String },

    #[error("Unknown source '{0}'")]
    UnknownSource(String),
}

impl FetchError {
    pub fn network(source_id: &str, message: impl Into<String>) -> Self {
        Self::Network {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn parse(source_id: &str, message: impl Into<String>, raw: &str) -> Self {
        Self::Parse {
            source_id: source_id.to_string(),
            message: message.into(),
            excerpt: excerpt(raw),
        }
    }

    pub fn schema(source_id: &str, message: impl Into<String>, raw: &str) -> Self {
        Self::Schema {
            source_id: source_id.to_string(),
            message: message.into(),
            excerpt: excerpt(raw),
        }
    }

    pub fn format(source_id: &str, message: impl Into<String>) -> Self {
        Self::Format {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled(source_id: &str) -> Self {
        Self::Cancelled {
            source_id: source_id.to_string(),
        }
    }

    /// Transport failures and limiter timeouts may succeed on a later attempt
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::RateLimitTimeout { .. }
        )
    }

    /// Content no longer matches the configured mapping
    #[must_use]
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            FetchError::Parse { .. } | FetchError::Schema { .. } | FetchError::Format { .. }
        )
    }
}

const EXCERPT_CHARS: usize = 200;

/// Leading slice of a raw payload for diagnostics
pub(crate) fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Outcome of one failing source inside an aggregated query
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: FetchError,
}

impl SourceFailure {
    pub fn new(source_id: &str, error: FetchError) -> Self {
        Self {
            source_id: source_id.to_string(),
            error,
        }
    }
}

impl std::fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.source_id, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(FetchError::network("a", "reset").is_retriable());
        assert!(
            FetchError::RateLimitTimeout {
                source_id: "a".into(),
                waited_ms: 10
            }
            .is_retriable()
        );
        assert!(!FetchError::parse("a", "anchor missing", "<html>").is_retriable());
        assert!(!FetchError::format("a", "too many bad rows").is_retriable());
        assert!(FetchError::schema("a", "not an array", "{}").is_content_error());
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let raw = "x".repeat(1000);
        let err = FetchError::parse("a", "bad", &raw);
        let FetchError::Parse { excerpt, .. } = err else {
            panic!("expected parse error");
        };
        assert_eq!(excerpt.len(), EXCERPT_CHARS + 3);
        assert!(excerpt.ends_with("..."));
    }
}
