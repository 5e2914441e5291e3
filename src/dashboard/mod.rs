// src/dashboard/mod.rs

//! Dashboard server.
//!
//! Provides a web server that:
//! - Exposes the controller's committed view over REST and WebSocket
//! - Accepts refresh, date, strategy, visibility and row-detail commands
//! - Proxies everything else to the origin through the offline cache,
//!   adding edge hints to each response

pub mod edge;

use crate::fetch::{HttpRequest, RequestBody};
use crate::models::StrategyKind;
use crate::offline::{OfflineCacheService, Served, ServedFrom};
use crate::sync::{DashboardView, DetailToggle, StrategySelection, SyncController};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Largest request body forwarded to the origin.
pub const MAX_PROXY_BODY_BYTES: usize = 8 * 1024 * 1024;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || name.eq_ignore_ascii_case("content-length")
}

/// Message pushed to WebSocket clients whenever a new view is published.
#[derive(Clone, Debug, Serialize)]
pub struct ViewUpdate {
    pub view: DashboardView,
    pub timestamp: i64,
}

impl ViewUpdate {
    fn now(view: DashboardView) -> Self {
        Self {
            view,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Shared state for the dashboard server.
pub struct DashboardState {
    controller: SyncController,
    offline: OfflineCacheService,
}

/// The dashboard server: live view endpoints plus the offline edge proxy.
pub struct DashboardServer {
    state: Arc<DashboardState>,
    port: u16,
}

impl DashboardServer {
    pub fn new(controller: SyncController, offline: OfflineCacheService, port: u16) -> Self {
        Self {
            state: Arc::new(DashboardState { controller, offline }),
            port,
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/sync/state", get(get_view))
            .route("/sync/ws", get(websocket_handler))
            .route("/sync/refresh", post(post_refresh))
            .route("/sync/date/{date}", post(post_date))
            .route("/sync/strategy/{strategy}", post(post_strategy))
            .route("/sync/visibility/{visible}", post(post_visibility))
            .route("/sync/details/{strategy}/{code}", post(post_toggle_detail))
            .fallback(proxy)
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serves on an already bound listener. Runs until the server stops.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Installs and activates the offline cache, then starts the server.
    /// This method runs until the server is shut down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.state.offline.install().await;
        self.state.offline.activate().await;

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Dashboard server starting on http://{}", addr);

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }
}

// =============================================================================
// Sync Endpoints
// =============================================================================

/// GET /sync/state - Latest committed view
async fn get_view(State(state): State<Arc<DashboardState>>) -> Json<DashboardView> {
    Json(state.controller.view())
}

/// POST /sync/refresh - Manual refresh
async fn post_refresh(State(state): State<Arc<DashboardState>>) -> Response {
    Json(state.controller.refresh()).into_response()
}

/// POST /sync/date/:date - Selects a date (YYYY-MM-DD, not after today)
async fn post_date(
    State(state): State<Arc<DashboardState>>,
    Path(date): Path<String>,
) -> Response {
    let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
        return (StatusCode::BAD_REQUEST, "Date must be YYYY-MM-DD").into_response();
    };
    let today = state.controller.clock().today();
    if date > today {
        return (
            StatusCode::BAD_REQUEST,
            format!("Date cannot be after {}", today),
        )
            .into_response();
    }
    Json(state.controller.select_date(date)).into_response()
}

/// POST /sync/strategy/:strategy - Selects a strategy if it is available
async fn post_strategy(
    State(state): State<Arc<DashboardState>>,
    Path(strategy): Path<String>,
) -> Response {
    let Ok(kind) = strategy.parse::<StrategyKind>() else {
        return (StatusCode::BAD_REQUEST, "Unknown strategy").into_response();
    };
    match state.controller.select_strategy(kind).await {
        StrategySelection::Selected => Json(json!({ "selected": true })).into_response(),
        StrategySelection::Unavailable(message) => (
            StatusCode::CONFLICT,
            Json(json!({ "selected": false, "message": message })),
        )
            .into_response(),
    }
}

/// POST /sync/visibility/:visible - Page visibility from the client
async fn post_visibility(
    State(state): State<Arc<DashboardState>>,
    Path(visible): Path<bool>,
) -> StatusCode {
    state.controller.set_visible(visible);
    StatusCode::NO_CONTENT
}

/// POST /sync/details/:strategy/:code - Expands or collapses a row
async fn post_toggle_detail(
    State(state): State<Arc<DashboardState>>,
    Path((strategy, code)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = strategy.parse::<StrategyKind>() else {
        return (StatusCode::BAD_REQUEST, "Unknown strategy").into_response();
    };
    match state.controller.toggle_detail(&code, kind).await {
        DetailToggle::Collapsed => Json(json!({ "expanded": false })).into_response(),
        DetailToggle::Expanded(detail) => {
            Json(json!({ "expanded": true, "detail": detail })).into_response()
        }
        DetailToggle::Failed(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "expanded": true, "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /sync/ws - WebSocket endpoint for view updates
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<DashboardState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn send_view(socket: &mut WebSocket, view: DashboardView) -> bool {
    match serde_json::to_string(&ViewUpdate::now(view)) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to encode view update: {}", e);
            true
        }
    }
}

async fn handle_websocket(mut socket: WebSocket, state: Arc<DashboardState>) {
    info!("WebSocket client connected");

    let mut rx = state.controller.subscribe();
    let initial = rx.borrow_and_update().clone();
    if !send_view(&mut socket, initial).await {
        return;
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = rx.borrow_and_update().clone();
                if !send_view(&mut socket, view).await {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// =============================================================================
// Edge Proxy
// =============================================================================

/// Everything outside `/sync` goes to the origin through the offline cache.
async fn proxy(State(state): State<Arc<DashboardState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let bytes = match axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, format!("Request body rejected: {}", e))
                .into_response()
        }
    };

    let mut upstream = HttpRequest::new(
        parts.method.clone(),
        state.offline.upstream_url(&path_and_query),
    );
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            upstream = upstream.with_header(name.as_str(), value);
        }
    }
    if !bytes.is_empty() {
        upstream = upstream.with_body(RequestBody::Bytes(bytes.to_vec()));
    }

    let mut response = match state.offline.handle(upstream).await {
        Ok(served) => into_response(served),
        Err(e) => {
            warn!("Proxy: {} {} failed: {}", parts.method, path, e);
            (StatusCode::BAD_GATEWAY, format!("Upstream unavailable: {}", e)).into_response()
        }
    };

    edge::apply_edge_headers(&parts.method, &path, &parts.headers, response.headers_mut());
    response
}

fn into_response(served: Served) -> Response {
    let Served { response, source } = served;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().append(name, value);
        }
    }
    if source == ServedFrom::Cache {
        out.headers_mut()
            .insert("x-offline-cache", HeaderValue::from_static("hit"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpResponse;

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("content-length"));
        assert!(is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("accept"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[test]
    fn test_cached_response_is_marked() {
        let response = HttpResponse::new(200, "cached page")
            .with_header("content-type", "text/html")
            .with_header("transfer-encoding", "chunked");
        let out = into_response(Served {
            response,
            source: ServedFrom::Cache,
        });
        assert_eq!(out.status(), StatusCode::OK);
        assert_eq!(out.headers().get("x-offline-cache").unwrap(), "hit");
        assert_eq!(out.headers().get("content-type").unwrap(), "text/html");
        assert!(out.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_network_response_keeps_status() {
        let out = into_response(Served {
            response: HttpResponse::new(404, "missing"),
            source: ServedFrom::Network,
        });
        assert_eq!(out.status(), StatusCode::NOT_FOUND);
        assert!(out.headers().get("x-offline-cache").is_none());
    }
}
