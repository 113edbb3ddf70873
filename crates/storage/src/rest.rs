//! Shared plumbing for the REST adapters

use std::ops::Range;

use reqwest::{Response, StatusCode};
use sd_core::{Error, Result};

use crate::settings::StorageSettings;

pub(crate) fn build_client(settings: &StorageSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout())
        .timeout(settings.request_timeout())
        .user_agent(concat!("sdutil/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}

/// Map an unexpected HTTP status onto the error taxonomy
pub(crate) fn classify_status(status: StatusCode, context: &str, body: &str) -> Error {
    let detail = if body.is_empty() {
        format!("{context}: HTTP {status}")
    } else {
        format!("{context}: HTTP {status}: {}", body.trim())
    };

    match status.as_u16() {
        401 | 403 => Error::Auth(detail),
        404 => Error::NotFound(detail),
        408 | 429 => Error::Transient(detail),
        s if s >= 500 => Error::Transient(detail),
        _ => Error::Provider(detail),
    }
}

/// Map a transport failure; anything that never reached the server is retryable
pub(crate) fn map_request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        Error::Transient(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status, "request failed", "")
    } else {
        Error::Provider(err.to_string())
    }
}

/// Pass through successful responses, classify the rest
pub(crate) async fn check(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, context, &body))
}

/// HTTP `Range` value for a half-open byte range
pub(crate) fn range_header(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end.saturating_sub(1))
}
