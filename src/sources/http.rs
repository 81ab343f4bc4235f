//! Transport shared by the adapters: HTTP GET and local file reads

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FetchError, until_cancelled};

/// Build the HTTP client shared by every adapter
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
}

pub(crate) fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Map a non-success status to the error taxonomy.
///
/// Throttling and server-side failures are transient; everything else means
/// the request itself is wrong and retrying will not help.
pub(crate) fn status_error(source_id: &str, status: StatusCode) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::network(source_id, format!("server answered {status}"))
    } else {
        FetchError::HttpStatus {
            source_id: source_id.to_string(),
            status: status.as_u16(),
        }
    }
}

/// GET `url` and return the body as text
pub(crate) async fn get_text(
    client: &Client,
    source_id: &str,
    url: &str,
    cancel: &CancellationToken,
) -> Result<String, FetchError> {
    debug!(source = source_id, url, "Requesting access point");

    let response = until_cancelled(cancel, source_id, client.get(url).send())
        .await?
        .map_err(|e| FetchError::network(source_id, format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(status_error(source_id, status));
    }

    until_cancelled(cancel, source_id, response.text())
        .await?
        .map_err(|e| FetchError::network(source_id, format!("failed to read body: {e}")))
}

/// Read an access point that is either a URL or a local file path
pub(crate) async fn load_text(
    client: &Client,
    source_id: &str,
    location: &str,
    cancel: &CancellationToken,
) -> Result<String, FetchError> {
    if is_remote(location) {
        return get_text(client, source_id, location, cancel).await;
    }

    debug!(source = source_id, path = location, "Reading local file");
    until_cancelled(cancel, source_id, tokio::fs::read_to_string(location))
        .await?
        .map_err(|e| FetchError::network(source_id, format!("cannot read {location}: {e}")))
}
