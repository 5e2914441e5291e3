// src/api/mod.rs

//! Typed client for the dashboard analytics API.
//!
//! Each method is one endpoint. Timeouts and cancellation are decided by the
//! caller through [`FetchOptions`]; the client only builds URLs and bodies
//! and decodes responses.

use crate::fetch::{
    fetch_with_timeout, FetchError, FetchOptions, FilePart, HttpRequest, Method, RequestBody,
};
use crate::models::{
    candidates_from_payload, HealthStatus, RequestParameters, StockCandidate, StockDetail,
    StrategyKind, StrategyStatus, StrategyValidation, WatchlistResponse, WeightsRecommendation,
};
use crate::traits::SharedTransport;
use chrono::NaiveDate;
use log::debug;
use serde::Serialize;
use serde_json::Value;
use url::Url;

/// Path prefix shared by every endpoint.
pub const API_PREFIX: &str = "/api/v1";

/// Candidate-list rows kept when the intraday list is shown as a side panel.
pub const INTRADAY_EXTRA_LIMIT: usize = 5;

/// Forced-refresh flags for the candidates endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceRefresh {
    pub refresh_token: u64,
}

#[derive(Serialize)]
struct WatchlistAddBody<'a> {
    user_key: &'a str,
    tickers: &'a [String],
}

#[derive(Clone)]
pub struct DashboardApi {
    transport: SharedTransport,
    base_url: Url,
    user_key: String,
}

impl DashboardApi {
    pub fn new(
        transport: SharedTransport,
        base_url: &str,
        user_key: impl Into<String>,
    ) -> Result<Self, String> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| format!("Invalid API base URL '{}': {}", base_url, e))?;
        if base_url.cannot_be_a_base() {
            return Err(format!("Invalid API base URL '{}': not a base URL", base_url));
        }
        Ok(Self {
            transport,
            base_url,
            user_key: user_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    /// Joins `segments` under the API prefix. Each segment is percent-encoded,
    /// so a `/` inside a ticker stays inside its segment.
    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(API_PREFIX.trim_start_matches('/').split('/'))
                .extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        url.to_string()
    }

    fn weight_query(params: &RequestParameters) -> Vec<(&'static str, String)> {
        vec![
            ("w_return", params.weights.ret.to_string()),
            ("w_stability", params.weights.stability.to_string()),
            ("w_market", params.weights.market.to_string()),
        ]
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// `GET /strategy-status?date=`
    pub async fn strategy_status(
        &self,
        date: NaiveDate,
        options: FetchOptions,
    ) -> Result<StrategyStatus, FetchError> {
        let url = self.endpoint(&["strategy-status"], &[("date", date.to_string())]);
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        response.json()
    }

    /// Query shared by the candidate list of any strategy.
    pub fn candidates_query(
        &self,
        params: &RequestParameters,
        strategy: StrategyKind,
        force: Option<ForceRefresh>,
    ) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("date", params.date.to_string()),
            ("strategy", strategy.to_string()),
        ];
        query.extend(Self::weight_query(params));
        query.extend([
            ("user_key", self.user_key.clone()),
            ("custom_tickers", params.tickers_query()),
            ("auto_regime_weights", params.auto_regime_weights.to_string()),
            ("enforce_exposure_cap", params.enforce_exposure_cap.to_string()),
            ("max_per_sector", params.max_per_sector.to_string()),
            ("cap_top_n", "5".to_string()),
            ("include_validation", "false".to_string()),
        ]);
        if let Some(force) = force {
            query.push(("force_refresh", "true".to_string()));
            query.push(("refresh_token", force.refresh_token.to_string()));
        }
        query.push(("include_sparkline", "true".to_string()));
        query
    }

    /// `GET /stock-candidates` for `strategy` (usually `params.strategy`).
    pub async fn stock_candidates(
        &self,
        params: &RequestParameters,
        strategy: StrategyKind,
        force: Option<ForceRefresh>,
        options: FetchOptions,
    ) -> Result<Vec<StockCandidate>, FetchError> {
        let url = self.endpoint(&["stock-candidates"], &self.candidates_query(params, strategy, force));
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        let payload: Value = response.json()?;
        let candidates = candidates_from_payload(payload);
        debug!(
            "DashboardApi: {} candidates for {}/{}",
            candidates.len(),
            strategy,
            params.date
        );
        Ok(candidates)
    }

    /// `GET /strategy-validation`
    pub async fn strategy_validation(
        &self,
        params: &RequestParameters,
        options: FetchOptions,
    ) -> Result<StrategyValidation, FetchError> {
        let mut query = vec![
            ("strategy", params.strategy.to_string()),
            ("date", params.date.to_string()),
            ("user_key", self.user_key.clone()),
            ("custom_tickers", params.tickers_query()),
        ];
        query.extend(Self::weight_query(params));
        query.push((
            "compare_branches",
            (params.strategy == StrategyKind::Intraday).to_string(),
        ));
        query.push(("compute_if_missing", "false".to_string()));

        let url = self.endpoint(&["strategy-validation"], &query);
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        response.json()
    }

    /// `GET /weights/recommendation`
    pub async fn weights_recommendation(
        &self,
        params: &RequestParameters,
        options: FetchOptions,
    ) -> Result<WeightsRecommendation, FetchError> {
        let query = [
            ("date", params.date.to_string()),
            ("user_key", self.user_key.clone()),
            ("custom_tickers", params.tickers_query()),
        ];
        let url = self.endpoint(&["weights", "recommendation"], &query);
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        response.json()
    }

    /// `GET /stocks/{code}/detail`
    pub async fn stock_detail(
        &self,
        code: &str,
        strategy: StrategyKind,
        params: &RequestParameters,
        options: FetchOptions,
    ) -> Result<StockDetail, FetchError> {
        let mut query = vec![
            ("date", params.date.to_string()),
            ("strategy", strategy.to_string()),
        ];
        query.extend(Self::weight_query(params));
        query.extend([
            ("include_news", "true".to_string()),
            ("include_ai", "true".to_string()),
            ("user_key", self.user_key.clone()),
            ("custom_tickers", params.tickers_query()),
            ("auto_regime_weights", params.auto_regime_weights.to_string()),
        ]);

        let url = self.endpoint(&["stocks", code, "detail"], &query);
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        response.json()
    }

    /// `GET /watchlist?user_key=`
    pub async fn watchlist(&self, options: FetchOptions) -> Result<WatchlistResponse, FetchError> {
        let url = self.endpoint(&["watchlist"], &[("user_key", self.user_key.clone())]);
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        response.json()
    }

    /// `GET /health`
    pub async fn health(&self, options: FetchOptions) -> Result<HealthStatus, FetchError> {
        let url = self.endpoint(&["health"], &[]);
        let response = fetch_with_timeout(self.transport.as_ref(), HttpRequest::get(url), options)
            .await?;
        response.json()
    }

    // =========================================================================
    // Mutations (never retried)
    // =========================================================================

    /// `POST /watchlist` `{user_key, tickers}`
    pub async fn add_to_watchlist(
        &self,
        tickers: &[String],
        options: FetchOptions,
    ) -> Result<WatchlistResponse, FetchError> {
        let body = WatchlistAddBody {
            user_key: &self.user_key,
            tickers,
        };
        let request = HttpRequest::new(Method::POST, self.endpoint(&["watchlist"], &[]))
            .with_json(&body)?;
        let response = fetch_with_timeout(self.transport.as_ref(), request, options).await?;
        response.json()
    }

    /// `DELETE /watchlist/{ticker}?user_key=`
    pub async fn remove_from_watchlist(
        &self,
        ticker: &str,
        options: FetchOptions,
    ) -> Result<WatchlistResponse, FetchError> {
        let url = self.endpoint(
            &["watchlist", ticker],
            &[("user_key", self.user_key.clone())],
        );
        let request = HttpRequest::new(Method::DELETE, url);
        let response = fetch_with_timeout(self.transport.as_ref(), request, options).await?;
        response.json()
    }

    /// `POST /watchlist/upload-csv` as multipart `file, user_key, replace`.
    pub async fn upload_watchlist_csv(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        replace: bool,
        options: FetchOptions,
    ) -> Result<WatchlistResponse, FetchError> {
        let body = RequestBody::Multipart {
            fields: vec![
                ("user_key".to_string(), self.user_key.clone()),
                ("replace".to_string(), replace.to_string()),
            ],
            files: vec![FilePart {
                field: "file".to_string(),
                file_name: file_name.to_string(),
                content_type: "text/csv".to_string(),
                bytes: contents,
            }],
        };
        let request = HttpRequest::new(Method::POST, self.endpoint(&["watchlist", "upload-csv"], &[]))
            .with_body(body);
        let response = fetch_with_timeout(self.transport.as_ref(), request, options).await?;
        response.json()
    }
}
