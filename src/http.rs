//! Shared JSON-over-HTTP plumbing for the embedding and completion providers.
//!
//! Providers map [`HttpFailure`] into their own error types so a timeout
//! stays distinguishable from a rejected request or a dropped connection.
//! Failure messages never contain the request URL.

use std::time::Duration;

/// How a provider call failed at the transport level.
#[derive(Debug)]
pub(crate) enum HttpFailure {
    Timeout,
    Status { status: u16, body: String },
    Network(String),
    Decode(String),
}

impl HttpFailure {
    /// Rate limits, server errors and dropped connections may succeed on retry.
    /// Timeouts are never retried.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            HttpFailure::Status { status, .. } => *status == 429 || *status >= 500,
            HttpFailure::Network(_) => true,
            HttpFailure::Timeout | HttpFailure::Decode(_) => false,
        }
    }
}

/// Credentials attached to a provider request. Keys always travel in headers.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Auth<'a> {
    None,
    Bearer(&'a str),
    /// Google's `x-goog-api-key` header.
    GoogleApiKey(&'a str),
}

impl Auth<'_> {
    pub(crate) fn apply(self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::GoogleApiKey(key) => request.header("x-goog-api-key", key),
        }
    }
}

pub(crate) fn build_client(timeout_secs: u64) -> Result<reqwest::Client, HttpFailure> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| HttpFailure::Network(e.without_url().to_string()))
}

/// Send a prepared request and decode a JSON body from a 2xx response.
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, HttpFailure> {
    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HttpFailure::Status {
            status: status.as_u16(),
            body,
        });
    }
    response.json().await.map_err(|e| {
        if e.is_timeout() {
            HttpFailure::Timeout
        } else {
            HttpFailure::Decode(e.without_url().to_string())
        }
    })
}

fn classify(err: reqwest::Error) -> HttpFailure {
    if err.is_timeout() {
        HttpFailure::Timeout
    } else {
        HttpFailure::Network(err.without_url().to_string())
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 32s.
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}
