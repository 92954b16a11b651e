//! In-process traffic inspector (§4.9): a small `axum` HTTP service over
//! the same `CaptureManager`/`TunnelManager` the connection loop already
//! populates, so an operator (or a local UI) can browse, filter, and
//! replay captured HTTP exchanges without a separate process.
//!
//! Grounded on nothing in `aether-proxy` itself — it has no
//! equivalent surface — so this module is built from `aether-hub`'s
//! `axum` + `tower_http::cors` + SSE usage (the pack's other example
//! closest to "small admin API over shared state").

mod filters;
mod replay;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::capture::{CaptureManager, CapturedExchange};
use crate::config::ClientConfig;
use crate::dialer::ResolvedAddrCache;
use crate::events::{ClientEvent, EventEmitter};
use crate::tunnel::manager::TunnelManager;

/// How many ports past the configured one to try before giving up
/// (§4.9: "tries this and up to +9").
const PORT_RANGE: u16 = 9;
const SSE_PING_INTERVAL: Duration = Duration::from_secs(30);

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub(crate) struct InspectorState {
    tunnels: TunnelManager,
    capture: CaptureManager,
    events: EventEmitter,
    dialer_cache: Arc<ResolvedAddrCache>,
    max_capture_body: usize,
    client_id: String,
    started_at: Instant,
}

/// Bind `config.inspector_port..=config.inspector_port + PORT_RANGE`,
/// taking the first free one, and spawn the service in the background.
/// Returns the address it actually bound to (for logging) and a handle
/// the caller can abort on shutdown.
pub async fn spawn(
    config: &ClientConfig,
    tunnels: TunnelManager,
    capture: CaptureManager,
    events: EventEmitter,
    dialer_cache: Arc<ResolvedAddrCache>,
    client_id: String,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = bind(config.inspector_port).await?;
    let addr = listener.local_addr()?;

    let state = InspectorState {
        tunnels,
        capture,
        events,
        dialer_cache,
        max_capture_body: config.capture_max_body_bytes,
        client_id,
        started_at: Instant::now(),
    };

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "inspector server exited");
        }
    });

    Ok((addr, handle))
}

async fn bind(first_port: u16) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for port in first_port..=first_port.saturating_add(PORT_RANGE) {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(error) => {
                tracing::debug!(port, %error, "inspector bind failed, trying next port");
                last_err = Some(error);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "no port available")
    }))
}

fn router(state: InspectorState) -> Router {
    Router::new()
        .route(
            "/api/requests/http",
            get(list_exchanges)
                .post(replay::replay)
                .delete(clear_exchanges)
                .options(preflight),
        )
        .route(
            "/api/requests/http/summary",
            get(summary).options(preflight),
        )
        .route(
            "/api/requests/http/stream",
            get(stream_exchanges).options(preflight),
        )
        .route(
            "/api/requests/http/{id}",
            get(get_exchange).options(preflight),
        )
        .route("/api/tunnels", get(list_tunnels).options(preflight))
        .route("/api/status", get(status).options(preflight))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    method: Option<String>,
    status: Option<String>,
    path: Option<String>,
    search: Option<String>,
    since: Option<String>,
    tunnel_name: Option<String>,
    #[serde(default)]
    include_body: bool,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ExchangeView {
    id: String,
    tunnel_id: String,
    started_at_millis: i64,
    duration_millis: i64,
    method: String,
    path: String,
    request_headers: Vec<(String, String)>,
    request_body_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_body_base64: Option<String>,
    status: u16,
    response_headers: Vec<(String, String)>,
    response_body_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_body_base64: Option<String>,
    replay_ref: Option<String>,
}

impl ExchangeView {
    fn from_exchange(exchange: &CapturedExchange, include_body: bool) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        Self {
            id: exchange.id.clone(),
            tunnel_id: exchange.tunnel_id.clone(),
            started_at_millis: exchange.started_at_millis,
            duration_millis: exchange.duration_millis,
            method: exchange.method.clone(),
            path: exchange.path.clone(),
            request_headers: exchange.request_headers.clone(),
            request_body_size: exchange.request_body_true_size,
            request_body_base64: include_body.then(|| STANDARD.encode(&exchange.request_body)),
            status: exchange.status,
            response_headers: exchange.response_headers.clone(),
            response_body_size: exchange.response_body_true_size,
            response_body_base64: include_body.then(|| STANDARD.encode(&exchange.response_body)),
            replay_ref: exchange.replay_ref.clone(),
        }
    }
}

/// Resolve a `tunnel_name` filter to the `tunnel_id` it currently maps
/// to. Returns `Ok(None)` when no filter was given, `Err(())` when a
/// filter was given but matches no active tunnel (caller should short
/// circuit to an empty page rather than ignore the filter).
fn resolve_tunnel_name(tunnels: &TunnelManager, name: Option<&str>) -> Result<Option<String>, ()> {
    match name {
        None => Ok(None),
        Some(name) => tunnels
            .snapshot()
            .iter()
            .find(|t| t.name == name)
            .map(|t| Some(t.tunnel_id.clone()))
            .ok_or(()),
    }
}

fn matches_query(exchange: &CapturedExchange, query: &ListQuery, tunnel_id: Option<&str>) -> bool {
    if let Some(tunnel_id) = tunnel_id {
        if exchange.tunnel_id != tunnel_id {
            return false;
        }
    }
    if let Some(method) = &query.method {
        if !filters::matches_method(&exchange.method, method) {
            return false;
        }
    }
    if let Some(status) = &query.status {
        if !filters::matches_status(exchange.status, status) {
            return false;
        }
    }
    if let Some(path) = &query.path {
        if !filters::matches_path(&exchange.path, path) {
            return false;
        }
    }
    if let Some(search) = &query.search {
        if !filters::matches_search(search, &exchange.request_body, &exchange.response_body) {
            return false;
        }
    }
    if let Some(since) = &query.since {
        match filters::since_cutoff_millis(now_millis(), since) {
            Some(cutoff) if exchange.started_at_millis >= cutoff => {}
            _ => return false,
        }
    }
    true
}

fn all_exchanges(capture: &CaptureManager) -> Vec<CapturedExchange> {
    let mut all = Vec::new();
    capture.for_each(|_, buffer| all.extend(buffer.snapshot_all()));
    all
}

async fn list_exchanges(
    State(state): State<InspectorState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let tunnel_id = match resolve_tunnel_name(&state.tunnels, query.tunnel_name.as_deref()) {
        Ok(id) => id,
        Err(()) => return Json(Vec::<ExchangeView>::new()).into_response(),
    };

    let mut matching: Vec<CapturedExchange> = all_exchanges(&state.capture)
        .into_iter()
        .filter(|exchange| matches_query(exchange, &query, tunnel_id.as_deref()))
        .collect();
    matching.sort_by(|a, b| b.started_at_millis.cmp(&a.started_at_millis));

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let page: Vec<ExchangeView> = matching
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|exchange| ExchangeView::from_exchange(&exchange, query.include_body))
        .collect();

    Json(page).into_response()
}

async fn get_exchange(
    State(state): State<InspectorState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.capture.lookup(&id) {
        Some(exchange) => Json(ExchangeView::from_exchange(&exchange, true)).into_response(),
        None => {
            (StatusCode::NOT_FOUND, Json(ErrorBody { error: "not found".into() })).into_response()
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct SummaryResponse {
    total: usize,
    by_status: std::collections::HashMap<String, usize>,
    by_method: std::collections::HashMap<String, usize>,
    error_rate: f64,
    average_duration_millis: f64,
    last_request_at_millis: Option<i64>,
}

async fn summary(State(state): State<InspectorState>) -> impl IntoResponse {
    let exchanges = all_exchanges(&state.capture);
    let total = exchanges.len();

    let mut by_status: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut by_method: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut error_count = 0usize;
    let mut duration_sum = 0i64;
    let mut last_request_at_millis: Option<i64> = None;

    for exchange in &exchanges {
        let bucket = format!("{}xx", exchange.status / 100);
        *by_status.entry(bucket).or_insert(0) += 1;
        *by_method.entry(exchange.method.clone()).or_insert(0) += 1;
        if exchange.status >= 400 {
            error_count += 1;
        }
        duration_sum += exchange.duration_millis;
        last_request_at_millis = Some(match last_request_at_millis {
            Some(latest) => latest.max(exchange.started_at_millis),
            None => exchange.started_at_millis,
        });
    }

    let error_rate = if total == 0 {
        0.0
    } else {
        error_count as f64 / total as f64
    };
    let average_duration_millis = if total == 0 {
        0.0
    } else {
        duration_sum as f64 / total as f64
    };

    Json(SummaryResponse {
        total,
        by_status,
        by_method,
        error_rate,
        average_duration_millis,
        last_request_at_millis,
    })
}

async fn clear_exchanges(State(state): State<InspectorState>) -> impl IntoResponse {
    state.capture.clear_all();
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct TunnelView {
    tunnel_id: String,
    name: String,
    kind: crate::protocol::message::TunnelKind,
    local_host: String,
    local_port: u16,
    url: Option<String>,
    remote_addr: Option<String>,
    remote_port: Option<u16>,
    bytes_in: u64,
    bytes_out: u64,
    connections_total: u64,
    connections_active: u64,
}

async fn list_tunnels(State(state): State<InspectorState>) -> impl IntoResponse {
    use std::sync::atomic::Ordering;
    let views: Vec<TunnelView> = state
        .tunnels
        .snapshot()
        .into_iter()
        .map(|tunnel| TunnelView {
            tunnel_id: tunnel.tunnel_id.clone(),
            name: tunnel.name.clone(),
            kind: tunnel.kind,
            local_host: tunnel.local_host.clone(),
            local_port: tunnel.local_port,
            url: tunnel.url.clone(),
            remote_addr: tunnel.remote_addr.clone(),
            remote_port: tunnel.remote_port,
            bytes_in: tunnel.bytes_in.load(Ordering::Relaxed),
            bytes_out: tunnel.bytes_out.load(Ordering::Relaxed),
            connections_total: tunnel.connections_total.load(Ordering::Relaxed),
            connections_active: tunnel.connections_active.load(Ordering::Relaxed),
        })
        .collect();
    Json(views)
}

#[derive(Serialize)]
struct StatusResponse {
    client_id: String,
    uptime_seconds: u64,
    tunnel_count: usize,
    capture_enabled: bool,
}

async fn status(State(state): State<InspectorState>) -> impl IntoResponse {
    Json(StatusResponse {
        client_id: state.client_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        tunnel_count: state.tunnels.len(),
        capture_enabled: state.capture.enabled(),
    })
}

async fn stream_exchanges(
    State(state): State<InspectorState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut rx = state.events.subscribe();
    let capture = state.capture.clone();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ClientEvent::CaptureRecorded { exchange_id, .. }) => {
                    if let Some(exchange) = capture.lookup(&exchange_id) {
                        let view = ExchangeView::from_exchange(&exchange, false);
                        if let Ok(json) = serde_json::to_string(&view) {
                            yield Ok(Event::default().event("exchange").data(json));
                        }
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_PING_INTERVAL).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::manager::ActiveTunnel;
    use std::sync::atomic::AtomicU64;

    fn exchange(id: &str, tunnel_id: &str, status: u16, method: &str, path: &str) -> CapturedExchange {
        CapturedExchange {
            id: id.into(),
            tunnel_id: tunnel_id.into(),
            started_at_millis: 0,
            duration_millis: 10,
            method: method.into(),
            path: path.into(),
            request_headers: Vec::new(),
            request_body: Vec::new(),
            request_body_true_size: 0,
            status,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            response_body_true_size: 0,
            replay_ref: None,
        }
    }

    #[test]
    fn matches_query_applies_every_filter() {
        let exchange = exchange("c-1", "t1", 404, "GET", "/api/users");
        let mut query = ListQuery {
            method: Some("get".into()),
            status: Some("4xx".into()),
            path: Some("/api/*".into()),
            search: None,
            since: None,
            tunnel_name: None,
            include_body: false,
            limit: None,
            offset: None,
        };
        assert!(matches_query(&exchange, &query, None));

        query.status = Some("200".into());
        assert!(!matches_query(&exchange, &query, None));
    }

    #[test]
    fn resolve_tunnel_name_fails_closed_on_unknown_name() {
        let tunnels = TunnelManager::new();
        tunnels.insert(ActiveTunnel {
            tunnel_id: "t1".into(),
            name: "web".into(),
            kind: crate::protocol::message::TunnelKind::Http,
            local_host: "127.0.0.1".into(),
            local_port: 8080,
            url: None,
            remote_addr: None,
            remote_port: None,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
        });

        assert_eq!(
            resolve_tunnel_name(&tunnels, Some("web")).unwrap(),
            Some("t1".to_string())
        );
        assert!(resolve_tunnel_name(&tunnels, Some("missing")).is_err());
        assert_eq!(resolve_tunnel_name(&tunnels, None).unwrap(), None);
    }

    #[tokio::test]
    async fn summary_computes_error_rate_and_buckets() {
        let capture = CaptureManager::new(10, true);
        capture.record("t1", exchange("c-1", "t1", 200, "GET", "/a"));
        capture.record("t1", exchange("c-2", "t1", 500, "POST", "/b"));

        let exchanges = all_exchanges(&capture);
        let errors = exchanges.iter().filter(|e| e.status >= 400).count();
        assert_eq!(errors, 1);
        assert_eq!(exchanges.len(), 2);
    }
}
