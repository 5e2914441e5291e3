// src/traits.rs

use crate::cache::CacheError;
use crate::fetch::{HttpRequest, HttpResponse, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Sends one HTTP request and returns the full response.
///
/// Implementations must be cancel-safe: the fetch primitive aborts a call by
/// dropping the returned future, which must release the connection and stop
/// reading the body.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Persistent key/value slot storage for dashboard snapshots.
/// No network I/O; a missing key is `Ok(None)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), CacheError>;
}

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Transports, stores and clocks are shared by every component of one
/// controller, so they travel as `Arc<dyn _>` handles.
pub type SharedTransport = Arc<dyn HttpTransport>;
pub type SharedSnapshotStore = Arc<dyn SnapshotStore>;
pub type SharedClock = Arc<dyn Clock>;
