// tests/edge_proxy.rs
//
// Dashboard server on a loopback port: view endpoints and the cached proxy.

mod common;

use common::{Harness, Reply, ScriptedTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use stock_dashboard::dashboard::DashboardServer;
use stock_dashboard::models::StrategyKind;
use stock_dashboard::offline::{CacheStorage, OfflineCacheService, OfflineSettings};
use tokio::net::TcpListener;
use url::Url;

struct Running {
    base: String,
    origin: Arc<ScriptedTransport>,
    client: reqwest::Client,
    _harness: Harness,
}

async fn spawn_server() -> Running {
    let harness = Harness::new(Some(StrategyKind::Close));
    let origin = ScriptedTransport::new();
    let offline = OfflineCacheService::new(
        origin.clone(),
        Arc::new(CacheStorage::new()),
        OfflineSettings::new(Url::parse("http://origin.test").unwrap()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = DashboardServer::new(harness.controller.clone(), offline, addr.port());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Running {
        base: format!("http://{}", addr),
        origin,
        client: reqwest::Client::builder().no_proxy().build().unwrap(),
        _harness: harness,
    }
}

#[tokio::test]
async fn test_state_endpoint_returns_view() {
    let server = spawn_server().await;
    let view: Value = server
        .client
        .get(format!("{}/sync/state", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["selectedDate"], "2025-01-10");
    assert_eq!(view["strategy"], "close");
    assert_eq!(view["lastTrigger"]["version"], 1);
}

#[tokio::test]
async fn test_refresh_endpoint_records_trigger() {
    let server = spawn_server().await;
    let event: Value = server
        .client
        .post(format!("{}/sync/refresh", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(event["version"], 2);
}

#[tokio::test]
async fn test_invalid_commands_are_rejected() {
    let server = spawn_server().await;

    let status = server
        .client
        .post(format!("{}/sync/strategy/swing", server.base))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    let status = server
        .client
        .post(format!("{}/sync/date/2099-01-01", server.base))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_proxy_adds_edge_headers_and_serves_cache_offline() {
    let server = spawn_server().await;
    server
        .origin
        .on("/api/v1/health", Reply::json(200, json!({ "status": "ok" })));
    server.origin.on("/api/v1/health", Reply::network("offline"));

    let url = format!("{}/api/v1/health?probe=1", server.base);
    let first = server
        .client
        .get(&url)
        .header("cf-ipcountry", "JP")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    assert_eq!(first.headers()["x-region-hint"], "JP");
    assert_eq!(first.headers()["x-edge-cache-hint"], "eligible");
    assert!(first.headers()["set-cookie"]
        .to_str()
        .unwrap()
        .starts_with("ab_bucket="));
    assert!(first.headers().get("x-offline-cache").is_none());
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let second = server
        .client
        .get(&url)
        .header("cookie", "ab_bucket=B")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::OK);
    assert_eq!(second.headers()["x-offline-cache"], "hit");
    assert!(second.headers().get("set-cookie").is_none());

    let forwarded = server.origin.requests();
    assert_eq!(forwarded[0].url, "http://origin.test/api/v1/health?probe=1");
    assert_eq!(forwarded[0].header("cf-ipcountry"), Some("JP"));
}

#[tokio::test]
async fn test_proxy_reports_bad_gateway_without_cache() {
    let server = spawn_server().await;
    server.origin.on("/missing", Reply::network("offline"));

    let response = server
        .client
        .post(format!("{}/missing", server.base))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(response.headers().get("x-edge-cache-hint").is_none());

    let forwarded = server.origin.requests();
    assert_eq!(
        forwarded[0].body,
        stock_dashboard::fetch::RequestBody::Bytes(b"payload".to_vec())
    );
}
