//! Shared HTTP plumbing for the Google API adapters

use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::sync::retry::RetryPolicy;
use crate::types::error::SyncError;

/// Longest error body kept in messages and logs
const MAX_ERROR_BODY: usize = 300;

/// HTTP client with the timeouts every adapter uses
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("mail2sheet/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// A failed request before it is mapped onto `SyncError`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    /// `None` when no response was received
    pub status: Option<StatusCode>,
    pub message: String,
}

impl RequestFailure {
    pub fn transport(err: reqwest::Error) -> Self {
        Self {
            status: None,
            message: err.to_string(),
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        Self {
            status: Some(status),
            message: api_error_message(body),
        }
    }

    /// Worth retrying: no response, throttling, or a server error
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => {
                status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
                    || self.is_rate_limited()
            }
        }
    }

    /// Google reports per-user quota exhaustion as 403
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(StatusCode::FORBIDDEN)
            && self.message.to_ascii_lowercase().contains("ratelimitexceeded")
    }

    fn code(&self) -> Option<u16> {
        self.status.map(|s| s.as_u16())
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status.as_u16(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Map a mailbox failure. `message_id` is set for per-message calls, where
/// 404 means the message is gone.
pub fn source_error(failure: RequestFailure, message_id: Option<&str>) -> SyncError {
    match (failure.code(), message_id) {
        (Some(401), _) => SyncError::AuthExpired(failure.to_string()),
        (Some(403), _) if !failure.is_rate_limited() => SyncError::AuthExpired(failure.to_string()),
        (Some(404), Some(id)) => SyncError::EventGone(id.to_string()),
        _ => SyncError::SourceUnavailable(failure.to_string()),
    }
}

/// Map a spreadsheet failure
pub fn sink_error(failure: RequestFailure) -> SyncError {
    if failure.is_transient() {
        SyncError::SinkUnavailable(failure.to_string())
    } else {
        SyncError::SinkRejected(failure.to_string())
    }
}

/// Send the request built by `build` under `policy`, returning the JSON
/// body (`Null` when empty). A new request is built for every attempt.
pub async fn send_json<F>(
    policy: &RetryPolicy,
    operation: &str,
    token: &str,
    build: F,
) -> Result<Value, RequestFailure>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let build = &build;
    policy
        .run(operation, RequestFailure::is_transient, move || async move {
            let response = build()
                .bearer_auth(token)
                .send()
                .await
                .map_err(RequestFailure::transport)?;
            read_json(response).await
        })
        .await
}

async fn read_json(response: reqwest::Response) -> Result<Value, RequestFailure> {
    let status = response.status();
    let body = response.text().await.map_err(RequestFailure::transport)?;

    if !status.is_success() {
        return Err(RequestFailure::from_status(status, &body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| RequestFailure {
        status: Some(status),
        message: format!("unexpected response body: {}", e),
    })
}

/// Pull `error.message` (and `error.status`) out of a Google error body
pub fn api_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let error = &value["error"];
        let message = error["message"].as_str().unwrap_or_default();
        let reason = error["errors"][0]["reason"]
            .as_str()
            .or_else(|| error["status"].as_str())
            .unwrap_or_default();
        match (message.is_empty(), reason.is_empty()) {
            (false, false) => return format!("{} ({})", message, reason),
            (false, true) => return message.to_string(),
            _ => {}
        }
    }
    body.trim().chars().take(MAX_ERROR_BODY).collect()
}

/// `base` with the given path segments appended, each percent-encoded
pub fn endpoint(base: &str, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url =
        Url::parse(base).map_err(|e| SyncError::Config(format!("Invalid API URL {}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Config(format!("API URL cannot have a path: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
