// src/offline/mod.rs

//! Offline cache service.
//!
//! Sits between the dashboard and its origin, independent of the sync
//! controller, and keeps the last good copy of pages, API responses and
//! assets. Each request class has its own policy:
//!
//! | Class       | Policy                    | Bucket  | On network failure          |
//! |-------------|---------------------------|---------|-----------------------------|
//! | Navigation  | network-first             | runtime | cached entry, then root page |
//! | API         | network-first             | api     | cached entry                |
//! | StaticAsset | cache-first               | static  | (error)                     |
//! | Other       | stale-while-revalidate    | runtime | cached entry, then root page |
//!
//! Only GET is ever cached. Buckets are named `<prefix>-<kind>-<version>`;
//! bumping the version and re-activating is the only way to invalidate.

pub mod storage;

pub use storage::CacheStorage;

use crate::fetch::{HttpRequest, HttpResponse, Method, TransportError};
use crate::traits::SharedTransport;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct OfflineSettings {
    pub prefix: String,
    pub version: String,
    /// Path fragment that marks API requests.
    pub api_prefix: String,
    /// Origin every request is forwarded to.
    pub upstream: Url,
    /// Paths stored in the static bucket at install time.
    pub precache: Vec<String>,
    pub network_timeout: Duration,
}

impl OfflineSettings {
    pub fn new(upstream: Url) -> Self {
        Self {
            prefix: "dailystock".to_string(),
            version: "v2".to_string(),
            api_prefix: "/api/v1/".to_string(),
            upstream,
            precache: vec!["/favicon.ico".to_string()],
            network_timeout: Duration::from_secs(30),
        }
    }
}

/// The three bucket names of one cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    pub static_assets: String,
    pub runtime: String,
    pub api: String,
}

impl CacheNames {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            static_assets: format!("{}-static-{}", prefix, version),
            runtime: format!("{}-runtime-{}", prefix, version),
            api: format!("{}-api-{}", prefix, version),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        name == self.static_assets || name == self.runtime || name == self.api
    }
}

// =============================================================================
// Classification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Navigation,
    Api,
    StaticAsset,
    Other,
}

const STATIC_DESTINATIONS: [&str; 3] = ["style", "script", "font"];
const STATIC_EXTENSIONS: [&str; 7] = ["css", "js", "mjs", "woff", "woff2", "ttf", "otf"];

/// Request class from fetch metadata, the Accept header or the extension.
pub fn classify(request: &HttpRequest, api_prefix: &str) -> ResourceClass {
    let mode = request.header("sec-fetch-mode").unwrap_or("");
    let dest = request.header("sec-fetch-dest").unwrap_or("");
    let accepts_html = request
        .header("accept")
        .is_some_and(|a| a.contains("text/html"));

    if mode.eq_ignore_ascii_case("navigate")
        || (mode.is_empty() && accepts_html && (dest.is_empty() || dest == "document"))
    {
        return ResourceClass::Navigation;
    }

    let path = Url::parse(&request.url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| request.url.clone());

    if request.url.contains(api_prefix) {
        return ResourceClass::Api;
    }

    if STATIC_DESTINATIONS.contains(&dest) {
        return ResourceClass::StaticAsset;
    }
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    if dest.is_empty()
        && extension
            .as_deref()
            .is_some_and(|ext| STATIC_EXTENSIONS.contains(&ext))
    {
        return ResourceClass::StaticAsset;
    }

    ResourceClass::Other
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Network,
    Cache,
    /// Non-GET, forwarded untouched.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub response: HttpResponse,
    pub source: ServedFrom,
}

impl Served {
    fn network(response: HttpResponse) -> Self {
        Self {
            response,
            source: ServedFrom::Network,
        }
    }

    fn cache(response: HttpResponse) -> Self {
        Self {
            response,
            source: ServedFrom::Cache,
        }
    }
}

/// Process-wide cache in front of the origin.
#[derive(Clone)]
pub struct OfflineCacheService {
    transport: SharedTransport,
    storage: Arc<CacheStorage>,
    names: CacheNames,
    settings: OfflineSettings,
}

impl OfflineCacheService {
    pub fn new(transport: SharedTransport, storage: Arc<CacheStorage>, settings: OfflineSettings) -> Self {
        Self {
            transport,
            storage,
            names: CacheNames::new(&settings.prefix, &settings.version),
            settings,
        }
    }

    pub fn names(&self) -> &CacheNames {
        &self.names
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn settings(&self) -> &OfflineSettings {
        &self.settings
    }

    /// Absolute upstream URL for a path (and query).
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        match self.settings.upstream.join(path_and_query) {
            Ok(url) => url.to_string(),
            Err(_) => format!(
                "{}{}",
                self.settings.upstream.as_str().trim_end_matches('/'),
                path_and_query
            ),
        }
    }

    fn root_key(&self) -> String {
        self.upstream_url("/")
    }

    /// Pre-caches the critical assets. Failures are ignored; returns how many
    /// were stored.
    pub async fn install(&self) -> usize {
        self.storage.open(&self.names.static_assets);
        let mut stored = 0;
        for path in &self.settings.precache {
            let url = self.upstream_url(path);
            match self.network(HttpRequest::get(url.clone())).await {
                Ok(response) if response.is_success() => {
                    self.storage.put(&self.names.static_assets, &url, response);
                    stored += 1;
                }
                Ok(response) => debug!(
                    "OfflineCache: precache {} skipped (status {})",
                    url, response.status
                ),
                Err(e) => debug!("OfflineCache: precache {} skipped: {}", url, e),
            }
        }
        info!(
            "OfflineCache: installed {} ({} of {} assets precached)",
            self.settings.version,
            stored,
            self.settings.precache.len()
        );
        stored
    }

    /// Deletes every bucket that is not part of the current version.
    pub async fn activate(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|name| !self.names.contains(name))
            .collect();
        for name in &stale {
            self.storage.delete(name);
        }
        for name in [&self.names.static_assets, &self.names.runtime, &self.names.api] {
            self.storage.open(name);
        }
        if !stale.is_empty() {
            info!("OfflineCache: activated, dropped {:?}", stale);
        }
        stale
    }

    async fn network(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        match tokio::time::timeout(self.settings.network_timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(format!(
                "no response within {:?}",
                self.settings.network_timeout
            ))),
        }
    }

    fn store(&self, bucket: &str, key: &str, response: &HttpResponse) {
        if response.is_success() {
            self.storage.put(bucket, key, response.clone());
        }
    }

    /// Serves one request according to its class.
    pub async fn handle(&self, request: HttpRequest) -> Result<Served, TransportError> {
        if request.method != Method::GET {
            let response = self.network(request).await?;
            return Ok(Served {
                response,
                source: ServedFrom::Passthrough,
            });
        }

        let key = request.url.clone();
        match classify(&request, &self.settings.api_prefix) {
            ResourceClass::Navigation => self.network_first(request, &key, true).await,
            ResourceClass::Api => self.network_first(request, &key, false).await,
            ResourceClass::StaticAsset => self.cache_first(request, &key).await,
            ResourceClass::Other => self.stale_while_revalidate(request, &key).await,
        }
    }

    async fn network_first(
        &self,
        request: HttpRequest,
        key: &str,
        navigation: bool,
    ) -> Result<Served, TransportError> {
        let bucket = if navigation {
            &self.names.runtime
        } else {
            &self.names.api
        };

        match self.network(request).await {
            Ok(response) => {
                self.store(bucket, key, &response);
                Ok(Served::network(response))
            }
            Err(e) => {
                warn!("OfflineCache: {} unreachable, trying cache: {}", key, e);
                let cached = self.storage.match_any(key).or_else(|| {
                    if navigation {
                        self.storage.match_any(&self.root_key())
                    } else {
                        None
                    }
                });
                cached.map(Served::cache).ok_or(e)
            }
        }
    }

    async fn cache_first(&self, request: HttpRequest, key: &str) -> Result<Served, TransportError> {
        if let Some(cached) = self.storage.match_any(key) {
            return Ok(Served::cache(cached));
        }
        let response = self.network(request).await?;
        self.store(&self.names.static_assets, key, &response);
        Ok(Served::network(response))
    }

    async fn stale_while_revalidate(
        &self,
        request: HttpRequest,
        key: &str,
    ) -> Result<Served, TransportError> {
        if let Some(cached) = self.storage.match_any(key) {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                match this.network(request).await {
                    Ok(response) => this.store(&this.names.runtime, &key, &response),
                    Err(e) => debug!("OfflineCache: revalidation of {} failed: {}", key, e),
                }
            });
            return Ok(Served::cache(cached));
        }

        match self.network(request).await {
            Ok(response) => {
                self.store(&self.names.runtime, key, &response);
                Ok(Served::network(response))
            }
            Err(e) => self
                .storage
                .match_any(&self.root_key())
                .map(Served::cache)
                .ok_or(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str, headers: &[(&str, &str)]) -> HttpRequest {
        headers
            .iter()
            .fold(HttpRequest::get(url), |r, (k, v)| r.with_header(*k, *v))
    }

    #[test]
    fn test_classify_by_metadata() {
        let api = "/api/v1/";
        assert_eq!(
            classify(&req("http://o/", &[("Sec-Fetch-Mode", "navigate")]), api),
            ResourceClass::Navigation
        );
        assert_eq!(
            classify(&req("http://o/history", &[("accept", "text/html,*/*")]), api),
            ResourceClass::Navigation
        );
        assert_eq!(
            classify(&req("http://o/api/v1/health", &[]), api),
            ResourceClass::Api
        );
        assert_eq!(
            classify(&req("http://o/x", &[("sec-fetch-dest", "font")]), api),
            ResourceClass::StaticAsset
        );
        assert_eq!(
            classify(&req("http://o/_next/app.JS", &[]), api),
            ResourceClass::StaticAsset
        );
        assert_eq!(
            classify(&req("http://o/logo.png", &[("sec-fetch-dest", "image")]), api),
            ResourceClass::Other
        );
    }

    #[test]
    fn test_cache_names() {
        let names = CacheNames::new("dailystock", "v2");
        assert_eq!(names.static_assets, "dailystock-static-v2");
        assert_eq!(names.runtime, "dailystock-runtime-v2");
        assert_eq!(names.api, "dailystock-api-v2");
        assert!(names.contains("dailystock-api-v2"));
        assert!(!names.contains("dailystock-api-v1"));
    }
}
