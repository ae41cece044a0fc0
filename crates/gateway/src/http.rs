//! Public HTTP surface. Grounded on `original_source/gateway/http/handlers.go` for
//! route shapes and `bchess-k8s-1m/mem_etcd/src/main.rs` for the axum `/metrics`
//! wiring.

use std::sync::Arc;

use std::time::Duration;

use axum::{
    extract::{Extension, State},
    http::Method,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fabric_common::{
    auth::{http_middleware::require_auth, TokenValidator},
    error::FabricError,
    model::{EventPayload, Principal},
    registerer::Registerer,
    UserId,
};
use presence::ActiveUserTracker;
use prometheus::{Encoder, TextEncoder};
use registry::ServerRegistry;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::relay::EventRelay;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub registerer: Arc<Registerer>,
    pub active_users: Arc<ActiveUserTracker>,
    pub server_registry: Arc<ServerRegistry>,
    pub relay: Arc<EventRelay>,
    pub validator: Arc<dyn TokenValidator>,
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/active-users", get(active_users))
        .route("/select-server", get(select_server))
        .route("/send-message", post(send_message))
        .layer(middleware::from_fn_with_state(
            state.validator.clone(),
            require_auth,
        ));

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/register", post(register))
        .route("/login", post(login))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buf) {
        tracing::error!(%err, "failed to encode prometheus metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse, FabricError> {
    state.registerer.register(&body.username, &body.password)?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse, FabricError> {
    let token = state.registerer.login(&body.username, &body.password)?;
    Ok(Json(TokenResponse { token }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, FabricError> {
    state
        .active_users
        .heart_beat(principal.user_id, principal.username)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveUsersResponse {
    active_users: Vec<fabric_common::model::ActiveUser>,
}

async fn active_users(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
) -> Result<impl IntoResponse, FabricError> {
    let active_users = state.active_users.active_users().await?;
    Ok(Json(ActiveUsersResponse { active_users }))
}

#[derive(Serialize)]
struct SelectServerResponse {
    address: String,
}

async fn select_server(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
) -> Result<impl IntoResponse, FabricError> {
    let info = state.server_registry.select_server_for_connection().await?;
    Ok(Json(SelectServerResponse {
        address: info.grpc_address,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    recipient_id: UserId,
    message: String,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, FabricError> {
    state
        .relay
        .forward(
            body.recipient_id,
            EventPayload::DirectMessage {
                sender_id: principal.user_id,
                message: body.message,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}
