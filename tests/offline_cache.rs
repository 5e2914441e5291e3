// tests/offline_cache.rs
//
// Offline cache policies against a scripted origin.

mod common;

use common::{Reply, ScriptedTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stock_dashboard::fetch::{HttpRequest, Method};
use stock_dashboard::offline::{CacheStorage, OfflineCacheService, OfflineSettings, ServedFrom};
use url::Url;

const ORIGIN: &str = "http://origin.test";

fn service(transport: &Arc<ScriptedTransport>) -> OfflineCacheService {
    let settings = OfflineSettings::new(Url::parse(ORIGIN).unwrap());
    OfflineCacheService::new(transport.clone(), Arc::new(CacheStorage::new()), settings)
}

fn get(path: &str) -> HttpRequest {
    HttpRequest::get(format!("{}{}", ORIGIN, path))
}

fn navigate(path: &str) -> HttpRequest {
    get(path)
        .with_header("sec-fetch-mode", "navigate")
        .with_header("accept", "text/html")
}

#[tokio::test(start_paused = true)]
async fn test_install_precaches_and_activate_drops_old_versions() {
    let transport = ScriptedTransport::new();
    transport.on("/favicon.ico", Reply::text(200, "icon"));
    let offline = service(&transport);

    offline.storage().open("dailystock-api-v1");
    offline.storage().open("unrelated-cache");

    assert_eq!(offline.install().await, 1);
    let dropped = offline.activate().await;
    assert_eq!(dropped, vec!["dailystock-api-v1", "unrelated-cache"]);

    let names = offline.names();
    assert_eq!(offline.storage().len(&names.static_assets), 1);
    let mut kept = offline.storage().keys();
    kept.sort();
    assert_eq!(
        kept,
        vec!["dailystock-api-v2", "dailystock-runtime-v2", "dailystock-static-v2"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_install_tolerates_missing_assets() {
    let transport = ScriptedTransport::new();
    let offline = service(&transport);
    assert_eq!(offline.install().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_api_is_network_first_with_cache_fallback() {
    let transport = ScriptedTransport::new();
    transport.on("/api/v1/health", Reply::json(200, json!({ "status": "ok" })));
    transport.on("/api/v1/health", Reply::network("offline"));
    let offline = service(&transport);

    let first = offline.handle(get("/api/v1/health")).await.unwrap();
    assert_eq!(first.source, ServedFrom::Network);

    let second = offline.handle(get("/api/v1/health")).await.unwrap();
    assert_eq!(second.source, ServedFrom::Cache);
    assert_eq!(second.response.text(), first.response.text());
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_error_responses_are_not_cached() {
    let transport = ScriptedTransport::new();
    transport.on("/api/v1/health", Reply::json(500, json!({ "detail": "boom" })));
    transport.on("/api/v1/health", Reply::network("offline"));
    let offline = service(&transport);

    let first = offline.handle(get("/api/v1/health")).await.unwrap();
    assert_eq!(first.response.status, 500);
    assert_eq!(first.source, ServedFrom::Network);

    assert!(offline.handle(get("/api/v1/health")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_navigation_falls_back_to_root_page() {
    let transport = ScriptedTransport::new();
    transport.on("/", Reply::text(200, "<html>home</html>"));
    transport.on("/", Reply::network("offline"));
    transport.on("/history", Reply::network("offline"));
    let offline = service(&transport);

    offline.handle(navigate("/")).await.unwrap();
    let served = offline.handle(navigate("/history")).await.unwrap();
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(served.response.text(), "<html>home</html>");
}

#[tokio::test(start_paused = true)]
async fn test_static_assets_are_cache_first() {
    let transport = ScriptedTransport::new();
    transport.on("/_next/app.js", Reply::text(200, "console.log(1)"));
    let offline = service(&transport);

    let first = offline.handle(get("/_next/app.js")).await.unwrap();
    let second = offline.handle(get("/_next/app.js")).await.unwrap();
    assert_eq!(first.source, ServedFrom::Network);
    assert_eq!(second.source, ServedFrom::Cache);
    assert_eq!(transport.requests_to("/_next/app.js").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_other_resources_revalidate_in_background() {
    let transport = ScriptedTransport::new();
    transport.on("/logo.png", Reply::text(200, "v1"));
    transport.on("/logo.png", Reply::text(200, "v2"));
    let offline = service(&transport);

    let first = offline.handle(get("/logo.png")).await.unwrap();
    assert_eq!(first.response.text(), "v1");

    let stale = offline.handle(get("/logo.png")).await.unwrap();
    assert_eq!(stale.source, ServedFrom::Cache);
    assert_eq!(stale.response.text(), "v1");

    tokio::time::sleep(Duration::from_millis(10)).await;
    let fresh = offline.handle(get("/logo.png")).await.unwrap();
    assert_eq!(fresh.source, ServedFrom::Cache);
    assert_eq!(fresh.response.text(), "v2");
}

#[tokio::test(start_paused = true)]
async fn test_non_get_passes_through_uncached() {
    let transport = ScriptedTransport::new();
    transport.on("/api/v1/watchlist", Reply::json(200, json!({ "tickers": ["005930"] })));
    transport.on("/api/v1/watchlist", Reply::network("offline"));
    let offline = service(&transport);

    let request = HttpRequest::new(Method::POST, format!("{}/api/v1/watchlist", ORIGIN));
    let served = offline.handle(request.clone()).await.unwrap();
    assert_eq!(served.source, ServedFrom::Passthrough);

    assert!(offline.handle(request).await.is_err());
    assert!(offline.handle(get("/api/v1/watchlist")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_slow_origin_times_out() {
    let transport = ScriptedTransport::new();
    transport.on(
        "/api/v1/health",
        Reply::json(200, json!({ "status": "ok" })).after(Duration::from_secs(31)),
    );
    let offline = service(&transport);

    let err = offline.handle(get("/api/v1/health")).await.unwrap_err();
    assert!(err.to_string().contains("no response"));
}
