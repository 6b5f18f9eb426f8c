use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::local::SpawnError;
use crate::session::{RegistryError, SessionId};
use crate::ssh::ConnectError;
use crate::supervisor::{CreateError, CreateFailure};
use crate::targets::TargetError;

/// Structured error type for the API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 403 - WebSocket upgrade from a foreign origin.
    OriginNotAllowed,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - No session with this id.
    SessionNotFound(String),
    /// 503 - Too many unredeemed WebSocket tickets.
    TicketLimit,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TicketLimit => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::TicketLimit => "ticket_limit",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a bearer token, or a ?ticket= for WebSockets."
                    .to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::OriginNotAllowed => "WebSocket origin not allowed.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::TicketLimit => "Too many pending tickets. Try again shortly.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<TargetError> for ApiError {
    fn from(e: TargetError) -> Self {
        ApiError::InvalidRequest(e.to_string())
    }
}

/// Body returned when a connect request fails after validation.
#[derive(Debug, Serialize)]
pub struct ConnectFailureBody {
    pub session_id: Option<SessionId>,
    pub status: &'static str,
    pub message: String,
    pub error_code: &'static str,
}

/// A failed `POST /api/connect`, rendered as `{session_id, status: "failed",
/// message, error_code}` with a status derived from the failure kind.
#[derive(Debug)]
pub struct ConnectFailed(pub CreateFailure);

impl ConnectFailed {
    pub fn status_code(&self) -> StatusCode {
        match &self.0.error {
            CreateError::Connect(ConnectError::AuthenticationFailed(_)) => StatusCode::UNAUTHORIZED,
            CreateError::Connect(ConnectError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            CreateError::Connect(_) => StatusCode::BAD_GATEWAY,
            CreateError::Spawn(SpawnError::PlatformUnsupported(_)) => StatusCode::NOT_IMPLEMENTED,
            CreateError::Spawn(SpawnError::ResourceExhausted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            CreateError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CreateError::Registry(RegistryError::MaxSessionsReached) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CreateError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CreateError::Cancelled => StatusCode::CONFLICT,
            CreateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ConnectFailed {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ConnectFailureBody {
            session_id: self.0.session_id,
            status: "failed",
            message: self.0.error.to_string(),
            error_code: self.0.error.code(),
        };
        (status, Json(body)).into_response()
    }
}
