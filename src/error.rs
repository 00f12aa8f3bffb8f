//! Unified error type shared by every service boundary and HTTP layer.
//!
//! [`Error`] carries the failure kind; the HTTP status code and machine code
//! are derived from the variant, so handlers return `Result<T, ApiError>`
//! and propagate with `?` — no manual `map_err`, no boilerplate.
//!
//! Two wire shapes exist:
//!
//! - the generic shape `{"error", "details", "code"}` used on admin and
//!   OpenAI-protocol paths ([`ApiError`]);
//! - the Anthropic envelope `{"type":"error","error":{...},"request_id"}`
//!   used on `/v1/messages*` paths ([`AnthropicError`]).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failure kinds surfaced by the control plane and router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A backend id, model, or job was not found anywhere.
    #[error("{0}")]
    NotFound(String),

    /// id/port/alias/modelPath collision, start of a running backend,
    /// cancel of a finished job.
    #[error("{0}")]
    Conflict(String),

    /// Another start/stop/restart is in flight for the same backend.
    /// Callers do not queue behind it — they retry with full information.
    #[error("operation already in progress for {0}")]
    OperationInProgress(String),

    /// Bad alias format, out-of-range port, unknown field, malformed body.
    #[error("{0}")]
    Validation(String),

    /// Missing or wrong admin API key.
    #[error("missing or invalid API key")]
    Unauthorized,

    /// The backend exists but is not running.
    #[error("{0}")]
    BackendDown(String),

    /// Network failure contacting a backend (connect refused, reset).
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The configured request timeout elapsed.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::OperationInProgress(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BackendDown(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code included in the generic error shape.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::OperationInProgress(_) => "OPERATION_IN_PROGRESS",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BackendDown(_) => "BACKEND_DOWN",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Anthropic error-envelope `error.type` value.
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found_error",
            Self::Conflict(_) | Self::OperationInProgress(_) | Self::Validation(_) => {
                "invalid_request_error"
            }
            Self::Unauthorized => "authentication_error",
            Self::BackendDown(_) => "overloaded_error",
            Self::Upstream(_) | Self::UpstreamTimeout | Self::Internal(_) => "api_error",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.into())
    }
}

/// [`Error`] rendered in the generic `{error, details, code}` shape.
///
/// Any type convertible into [`Error`] converts into [`ApiError`], so
/// handlers can use `?` on service calls directly.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, code = self.0.code(), "handler error");
        }
        (
            status,
            Json(json!({
                "error": self.0.to_string(),
                "details": self.0.to_string(),
                "code": self.0.code(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// [`Error`] rendered in the Anthropic error envelope, used on
/// `/v1/messages*` paths. Each response carries a fresh `request_id`.
#[derive(Debug)]
pub struct AnthropicError(pub Error);

impl IntoResponse for AnthropicError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "anthropic handler error");
        }
        (
            status,
            Json(json!({
                "type": "error",
                "error": {
                    "type": self.0.anthropic_type(),
                    "message": self.0.to_string(),
                },
                "request_id": format!("req_{}", uuid::Uuid::new_v4().simple()),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AnthropicError
where
    E: Into<Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
