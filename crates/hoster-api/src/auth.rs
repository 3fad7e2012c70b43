//! Gateway-header authentication.
//!
//! An upstream gateway terminates end-user auth and injects identity
//! headers. The API trusts them, optionally verifying a shared secret
//! so nothing can bypass the gateway.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::ApiState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const PLAN_ID_HEADER: &str = "x-plan-id";
pub const KEY_ID_HEADER: &str = "x-key-id";
pub const GATEWAY_SECRET_HEADER: &str = "x-apigate-secret";

/// The authenticated caller, as asserted by the gateway.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub plan_id: Option<String>,
    pub key_id: Option<String>,
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing X-User-ID header".to_string()))?;
        Ok(Identity {
            user_id,
            plan_id: header(PLAN_ID_HEADER),
            key_id: header(KEY_ID_HEADER),
        })
    }
}

/// Reject requests without the configured shared secret. A no-op when
/// no secret is configured.
pub async fn require_gateway_secret(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.gateway_secret {
        let presented = request
            .headers()
            .get(GATEWAY_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err(ApiError::Unauthorized("invalid gateway secret".to_string()));
        }
    }
    Ok(next.run(request).await)
}
