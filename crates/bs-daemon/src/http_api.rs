//! Read-only HTTP surface over the current snapshot.
//!
//! - `GET /accounts.json` the persisted document shape, `404` until the first
//!   job result exists
//! - `GET /healthz` liveness plus the time of the last successful refresh

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bs_core::store::AggregateStore;
use bs_harness::shutdown::ShutdownSignal;
use serde_json::json;
use tracing::{info, warn};

/// Shared state for all handlers.
pub struct ApiState {
    pub store: Arc<AggregateStore>,
    /// Clients allowed to read; empty allows everyone.
    pub allowed_ips: Vec<IpAddr>,
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/accounts.json", get(get_accounts))
        .route("/healthz", get(get_health))
        .layer(middleware::from_fn_with_state(state.clone(), allow_list))
        .with_state(state)
}

async fn allow_list(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    if state.allowed_ips.is_empty() {
        return next.run(request).await;
    }
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    match peer {
        Some(ip) if state.allowed_ips.contains(&ip) => next.run(request).await,
        _ => {
            warn!(peer = ?peer, path = %request.uri().path(), "request from address not in allow list");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn get_accounts(State(state): State<Arc<ApiState>>) -> Response {
    let snapshot = state.store.snapshot();
    if snapshot.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no data yet"})),
        )
            .into_response();
    }
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Json(snapshot.as_ref().clone()),
    )
        .into_response()
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let snapshot = state.store.snapshot();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "updated_at": snapshot.updated_at,
        "last_success": snapshot.last_success(),
    }))
}

/// Serve until shutdown is triggered.
pub async fn serve(
    state: Arc<ApiState>,
    addr: SocketAddr,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http read path listening");
    axum::serve(
        listener,
        api_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.triggered().await })
    .await
}
