use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Transport-neutral error taxonomy shared by the gateway and event-server binaries.
/// Mapped to HTTP status codes (`IntoResponse`) and gRPC status codes (`From<FabricError>
/// for tonic::Status`) at the transport boundary; business logic only ever sees this enum.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not connected")]
    NotConnected,
    #[error("server gone")]
    ServerGone,
    #[error("delivery failed: status {status}")]
    DeliveryFailed { status: u16 },
    #[error("already running")]
    AlreadyRunning,
    #[error("not running")]
    NotRunning,
    #[error("not leased")]
    NotLeased,
    #[error("lease lost")]
    LeaseLost,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    details: String,
}

impl IntoResponse for FabricError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            FabricError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FabricError::BadRequest(_) | FabricError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            FabricError::NotConnected
            | FabricError::ServerGone
            | FabricError::DeliveryFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            details: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<FabricError> for tonic::Status {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::Unauthorized(msg) => tonic::Status::unauthenticated(msg),
            FabricError::BadRequest(msg) | FabricError::InvalidConfig(msg) => {
                tonic::Status::invalid_argument(msg)
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
