//! API error mapping.
//!
//! Every internal error kind maps to a stable status code and the
//! uniform JSON envelope. Proxy-facing not-found stays HTML; this is
//! the JSON side.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use hoster_deployer::DeployError;
use hoster_store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Unavailable(m)
            | Self::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.message(), "request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": self.message(),
            })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::Conflict(m) => ApiError::Conflict(m),
            StoreError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Store(inner) => inner.into(),
            DeployError::Plan(inner) => ApiError::BadRequest(inner.to_string()),
            DeployError::Rejected(reason) => ApiError::Conflict(reason),
            DeployError::NodeUnavailable(m) => ApiError::Unavailable(m),
            DeployError::Runtime(inner) => ApiError::Internal(inner.to_string()),
            DeployError::PortsExhausted(start, end) => {
                ApiError::Unavailable(format!("no free proxy port in {start}-{end}"))
            }
        }
    }
}

impl From<hoster_core::CoreError> for ApiError {
    fn from(e: hoster_core::CoreError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}
