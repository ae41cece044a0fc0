//! HTTP surface: `/send-event` (Gateway relay target), `/send-message` (legacy
//! direct path, authenticated), `/health`, `/metrics`. Grounded on
//! `bchess-k8s-1m/mem_etcd/src/main.rs`'s axum `/metrics` wiring and
//! `original_source/eventserver/grpc/grpc_server.go`'s HTTP companion routes.

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
    model::{EventPayload, Principal, SendEventRequest},
    UserId,
};
use fabric_proto::eventserver::{event::Payload, DirectMessage, Event};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::session::{EventServer, SessionError};

const SEND_DEADLINE: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<EventServer>,
    pub validator: Arc<dyn TokenValidator>,
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
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
        .route("/send-event", post(send_event))
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

async fn send_event(
    State(state): State<AppState>,
    Json(request): Json<SendEventRequest>,
) -> Result<impl IntoResponse, FabricError> {
    let event = event_from_payload(request.payload);

    state
        .sessions
        .send_event(request.recipient_id, event, SEND_DEADLINE)
        .await
        .map_err(session_error_to_fabric)?;

    Ok(Json(serde_json::json!({"status": "ok"})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    recipient_id: UserId,
    message: String,
}

#[derive(Serialize)]
struct StatusOk {
    status: &'static str,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, FabricError> {
    let event = event_from_payload(EventPayload::DirectMessage {
        sender_id: principal.user_id,
        message: request.message,
    });

    state
        .sessions
        .send_event(request.recipient_id, event, SEND_DEADLINE)
        .await
        .map_err(session_error_to_fabric)?;

    Ok(Json(StatusOk { status: "ok" }))
}

fn event_from_payload(payload: EventPayload) -> Event {
    match payload {
        EventPayload::DirectMessage { sender_id, message } => Event {
            payload: Some(Payload::DirectMessage(DirectMessage {
                sender_id: sender_id.to_string(),
                message,
            })),
        },
    }
}

/// `RecipientNotOnThisServer` is the Event Server's local, per-process notion that
/// the Gateway's relay translates into `DeliveryFailed` at its own boundary
/// (SPEC_FULL.md §4.6); here, a step closer to the recipient, it is reported as
/// `NotConnected` so callers see a consistent "recipient isn't reachable from here".
fn session_error_to_fabric(err: SessionError) -> FabricError {
    match err {
        SessionError::RecipientNotOnThisServer => FabricError::NotConnected,
        SessionError::SinkSendFailed => FabricError::Unavailable("stream send failed".into()),
    }
}
