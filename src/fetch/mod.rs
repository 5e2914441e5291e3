// src/fetch/mod.rs

//! Resilient fetch primitive.
//!
//! [`fetch_with_timeout`] wraps one [`HttpTransport`] call with a per-call
//! deadline and a cancellation token derived from the caller's signal, and
//! sorts every failure into a [`FetchError`] variant the controller can act on.

pub mod cancel;
pub mod http;

pub use cancel::{CancelReason, CancelToken};
pub use http::ReqwestTransport;

use crate::traits::HttpTransport;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub use reqwest::Method;

// =============================================================================
// Request / Response
// =============================================================================

/// A file sent as one part of a multipart form.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    /// Forwarded verbatim (proxied request bodies).
    Bytes(Vec<u8>),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, FetchError> {
        let value = serde_json::to_value(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
            .with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turns a non-2xx response into [`FetchError::Http`].
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.is_success() {
            return Ok(self);
        }
        let body = self.text();
        Err(FetchError::Http {
            status: self.status,
            message: read_api_error(self.status, &body),
            body,
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// =============================================================================
// Errors
// =============================================================================

/// Failure raised by a transport before any response arrived.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Aborted by the caller's signal. Never surfaced to the user.
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    /// Non-2xx. `message` is the human-readable detail extracted from `body`.
    #[error("{message}")]
    Http {
        status: u16,
        body: String,
        message: String,
    },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Coarse failure class, used by views and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    Timeout,
    Network,
    Http,
    Decode,
    ContextMismatch,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Cancelled => FailureKind::Cancelled,
            FetchError::Timeout(_) => FailureKind::Timeout,
            FetchError::Network(_) => FailureKind::Network,
            FetchError::Http { .. } => FailureKind::Http,
            FetchError::Decode(_) => FailureKind::Decode,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }
}

/// Human-readable detail of an API error body.
///
/// Looks at `detail` (string), then `detail.message`, then `message`; falls
/// back to a status-derived message.
pub fn read_api_error(status: u16, body: &str) -> String {
    let fallback = format!("API request failed ({})", status);
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return fallback;
    };

    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    non_empty(value.get("detail"))
        .or_else(|| non_empty(value.get("detail").and_then(|d| d.get("message"))))
        .or_else(|| non_empty(value.get("message")))
        .unwrap_or(fallback)
}

// =============================================================================
// Fetch With Timeout
// =============================================================================

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Upstream signal. The call gets its own child of it.
    pub signal: Option<CancelToken>,
}

impl FetchOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: &CancelToken) -> Self {
        self.signal = Some(signal.clone());
        self
    }
}

/// Runs one request under a deadline and the caller's cancellation signal.
///
/// Returns the 2xx response; everything else is a [`FetchError`]. Timer,
/// listener and transport future are all dropped when this returns, and the
/// per-call token detaches from its parent.
pub async fn fetch_with_timeout(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    options: FetchOptions,
) -> Result<HttpResponse, FetchError> {
    let token = match &options.signal {
        Some(parent) => parent.child(),
        None => CancelToken::new(),
    };

    if token.is_cancelled() {
        debug!("Fetch: {} {} skipped, signal already fired", request.method, request.url);
        return Err(FetchError::Cancelled);
    }

    let method = request.method.clone();
    let url = request.url.clone();

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(FetchError::Cancelled),
        _ = tokio::time::sleep(options.timeout) => {
            token.cancel_with(CancelReason::TimedOut);
            Err(FetchError::Timeout(options.timeout))
        }
        sent = transport.send(request) => {
            sent.map_err(|e| FetchError::Network(e.0))
        }
    };

    match &result {
        Ok(response) => debug!("Fetch: {} {} -> {}", method, url, response.status),
        Err(e) => debug!("Fetch: {} {} failed: {}", method, url, e),
    }

    result?.error_for_status()
}

// =============================================================================
// Tests
// =============================================================================
