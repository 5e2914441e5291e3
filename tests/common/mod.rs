// tests/common/mod.rs
//
// Scripted network and fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stock_dashboard::api::DashboardApi;
use stock_dashboard::cache::{MemorySnapshotStore, SnapshotCache};
use stock_dashboard::clock::{ExchangeClock, ManualClock};
use stock_dashboard::fetch::{HttpRequest, HttpResponse, TransportError};
use stock_dashboard::models::StrategyKind;
use stock_dashboard::sync::{SyncController, SyncSettings, UiParameters};
use stock_dashboard::traits::{HttpTransport, SharedSnapshotStore};
use url::Url;

pub const API_BASE: &str = "http://api.test";

// =============================================================================
// Scripted Transport
// =============================================================================

/// One scripted answer.
#[derive(Clone, Debug)]
pub struct Reply {
    pub delay: Duration,
    pub outcome: Result<HttpResponse, TransportError>,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(HttpResponse::json_body(status, &body)),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(HttpResponse::new(status, body.as_bytes().to_vec())),
        }
    }

    pub fn network(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(TransportError::new(message)),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Answers by URL path. Replies for a path are consumed in order; the last
/// one repeats. Unscripted paths get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, path: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Drops whatever is scripted for `path` and scripts `reply` instead.
    pub fn replace(&self, path: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        routes.insert(path.to_string(), VecDeque::from([reply]));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| path_of(&r.url) == path)
            .collect()
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Reply::json(404, json!({ "detail": format!("no route for {}", path) })),
        }
    }
}

pub fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Value of one query parameter of a logged request.
pub fn query_param(request: &HttpRequest, name: &str) -> Option<String> {
    Url::parse(&request.url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    })
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&request.url);
        self.log.lock().unwrap().push(request);
        let reply = self.next_reply(&path);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.outcome
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub const STATUS: &str = "/api/v1/strategy-status";
pub const CANDIDATES: &str = "/api/v1/stock-candidates";
pub const VALIDATION: &str = "/api/v1/strategy-validation";
pub const WATCHLIST: &str = "/api/v1/watchlist";
pub const RECOMMENDATION: &str = "/api/v1/weights/recommendation";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 2025-01-10 12:00 in Seoul (inside the intraday window).
pub fn seoul_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 10, 3, 0, 0).unwrap()
}

pub fn status_body(on: NaiveDate, available: &[StrategyKind], default: Option<StrategyKind>) -> Value {
    json!({
        "timezone": "Asia/Seoul",
        "requestedDate": on.to_string(),
        "availableStrategies": available,
        "defaultStrategy": default,
        "messages": {
            "premarket": "",
            "intraday": "Intraday opens at 09:05.",
            "close": ""
        }
    })
}

pub fn candidate(code: &str, change_rate: f64, session_date: &str) -> Value {
    json!({
        "rank": 1,
        "name": format!("Stock {}", code),
        "code": code,
        "score": 80.0,
        "changeRate": change_rate,
        "price": 10000.0,
        "targetPrice": 11000.0,
        "stopLoss": 9500.0,
        "sessionDate": session_date
    })
}

pub fn candidates_body(codes: &[&str]) -> Value {
    let list: Vec<Value> = codes
        .iter()
        .map(|code| candidate(code, 1.5, "2025-01-10"))
        .collect();
    json!({ "candidates": list })
}

pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemorySnapshotStore>,
    pub controller: SyncController,
}

impl Harness {
    /// Controller on 2025-01-10 with `strategy` preselected.
    pub fn new(strategy: Option<StrategyKind>) -> Self {
        Self::with_settings(strategy, SyncSettings::default())
    }

    pub fn with_settings(strategy: Option<StrategyKind>, settings: SyncSettings) -> Self {
        Self::with_store(strategy, settings, |store| store as SharedSnapshotStore)
    }

    /// Like `with_settings`, with the snapshot store wrapped by `wrap`.
    /// `store` still sees every write that reaches the wrapped memory store.
    pub fn with_store<F>(strategy: Option<StrategyKind>, settings: SyncSettings, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemorySnapshotStore>) -> SharedSnapshotStore,
    {
        let transport = ScriptedTransport::new();
        let clock = ManualClock::new(seoul_noon());
        let store = MemorySnapshotStore::shared();

        let api = DashboardApi::new(transport.clone(), API_BASE, "tester").unwrap();
        let exchange = ExchangeClock::seoul(clock.clone());
        let cache = SnapshotCache::new(wrap(store.clone()));

        let mut params = UiParameters::new(exchange.today());
        params.strategy = strategy;

        let controller = SyncController::new(api, exchange, cache, settings, params);
        Self {
            transport,
            clock,
            store,
            controller,
        }
    }

    /// Scripts an empty watchlist and availability of `available` for the
    /// harness date.
    pub fn script_prerequisites(&self, available: &[StrategyKind], default: Option<StrategyKind>) {
        self.transport.on(
            WATCHLIST,
            Reply::json(200, json!({ "userKey": "tester", "tickers": [] })),
        );
        self.transport.on(
            STATUS,
            Reply::json(200, status_body(date(2025, 1, 10), available, default)),
        );
    }

    /// Loads watchlist and availability, as `start` would.
    pub async fn load_prerequisites(&self) {
        self.controller.load_watchlist().await;
        self.controller.refresh_availability().await.unwrap();
    }
}
