//! Source adapters
//!
//! This module turns external data sources into normalized [`Record`]s:
//! - HTML pages scraped with CSS selectors
//! - JSON APIs mapped with dotted paths
//! - CSV files imported row by row
//!
//! Every adapter implements [`SourceAdapter`] and is selected once at startup
//! from the `mapping` of its [`SourceDescriptor`]. Adapters keep no state
//! between calls, so the engine may call them concurrently.

pub mod csv;
pub mod error;
pub mod html;
pub mod http;
pub mod json;
pub mod values;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::locations::LocationDirectory;
use crate::models::{Record, RecordKind, SourceDescriptor, SourceMapping};

pub use self::csv::CsvSource;
pub use error::{FetchError, SourceFailure};
pub use html::HtmlSource;
pub use json::JsonSource;

/// Capability shared by every source variant
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Fetch and parse all records the source offers for `subject`.
    ///
    /// Implementations must return promptly with [`FetchError::Cancelled`]
    /// once `cancel` fires while waiting on I/O.
    async fn fetch(
        &self,
        subject: &str,
        kind: RecordKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, FetchError>;

    fn id(&self) -> &str {
        &self.descriptor().id
    }
}

/// Build the adapter matching the descriptor's mapping
pub fn build_adapter(
    descriptor: SourceDescriptor,
    client: reqwest::Client,
    locations: Option<Arc<LocationDirectory>>,
) -> Arc<dyn SourceAdapter> {
    match &descriptor.mapping {
        SourceMapping::Html(_) => Arc::new(HtmlSource::new(descriptor, client, locations)),
        SourceMapping::Json(_) => Arc::new(JsonSource::new(descriptor, client, locations)),
        SourceMapping::Csv(_) => Arc::new(CsvSource::new(descriptor, client, locations)),
    }
}

/// Await `fut` unless `cancel` fires first
pub(crate) async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    source_id: &str,
    fut: F,
) -> Result<F::Output, FetchError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FetchError::cancelled(source_id)),
        output = fut => Ok(output),
    }
}

/// Content mismatches are logged once with the offending payload excerpt
pub(crate) fn log_content_error(err: &FetchError) {
    match err {
        FetchError::Parse {
            source_id,
            message,
            excerpt,
        }
        | FetchError::Schema {
            source_id,
            message,
            excerpt,
        } => warn!(
            source = %source_id,
            %message,
            %excerpt,
            "Source content does not match its mapping"
        ),
        FetchError::Format { source_id, message } => {
            warn!(source = %source_id, %message, "Source rejected as malformed")
        }
        _ => {}
    }
}

/// Expand an access-point template for one subject.
///
/// Placeholders: `{subject}`, `{origin}` and `{destination}` (for
/// `origin->destination` subjects) and, when the directory knows the
/// subject, `{lat}`, `{lng}`, `{city_ascii}` and `{country}`. Values are
/// URL-encoded for HTTP templates.
pub(crate) fn render_access_point(
    template: &str,
    subject: &str,
    locations: Option<&LocationDirectory>,
) -> String {
    let is_url = template.starts_with("http://") || template.starts_with("https://");
    let encode = |value: &str| -> String {
        if is_url {
            urlencoding::encode(value).into_owned()
        } else {
            value.to_string()
        }
    };

    let mut rendered = template.replace("{subject}", &encode(subject));

    if let Some((origin, destination)) = subject.split_once("->") {
        rendered = rendered
            .replace("{origin}", &encode(origin.trim()))
            .replace("{destination}", &encode(destination.trim()));
    }

    if let Some(location) = locations.and_then(|dir| dir.resolve(subject)) {
        rendered = rendered
            .replace("{lat}", &location.latitude.to_string())
            .replace("{lng}", &location.longitude.to_string())
            .replace("{city_ascii}", &encode(&location.ascii_name))
            .replace("{country}", &encode(&location.country));
    }

    rendered
}
