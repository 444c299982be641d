//! API error types and helpers.
//!
//! # Purpose and responsibility
//! Centralizes HTTP error response construction so every endpoint and gate
//! returns the same `{code, message, request_id}` body.
//!
//! # Key invariants and assumptions
//! - Infrastructure failures behind an authorization decision are 503, never
//!   an implicit allow.
//! - Denials name only the denied scope; internal details are logged, not
//!   returned.
use crate::api::types::ErrorResponse;
use crate::authz::AuthzError;
use crate::cache::CacheError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::error::Error;

/// Structured API error returned by handlers and gates.
///
/// `status` must match the semantics of `body.code`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
            request_id: None,
        },
    }
}

pub fn api_not_found(message: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, "not_found", message)
}

/// Build a 401 Unauthorized error for a missing or unknown caller.
pub fn api_unauthorized(message: &str) -> ApiError {
    api_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

/// Build a 403 Forbidden error. The message is shown to the caller verbatim.
pub fn api_forbidden(message: &str) -> ApiError {
    api_error(StatusCode::FORBIDDEN, "forbidden", message)
}

pub fn api_validation_error(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

/// Build a 503 Service Unavailable error, logging the cause server-side.
pub fn api_unavailable(message: &str, err: &dyn Error) -> ApiError {
    tracing::error!(error = %err, "dependency unavailable");
    api_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
}

/// Build a 500 Internal Server Error, logging the cause server-side.
pub fn api_internal(message: &str, err: &dyn Error) -> ApiError {
    tracing::error!(error = %err, "internal error");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Map a cache failure: transient ones are 503 so clients retry.
pub fn api_cache_error(message: &str, err: &CacheError) -> ApiError {
    if let CacheError::KeyConflict(key) = err {
        tracing::warn!(%key, "cache write refused");
        return api_error(StatusCode::CONFLICT, "conflict", message);
    }
    if err.is_retryable() {
        api_unavailable(message, err)
    } else {
        api_internal(message, err)
    }
}

/// Map an authorization failure. Every infrastructure error fails closed.
pub fn api_authz_error(err: &AuthzError) -> ApiError {
    match err {
        AuthzError::Cache(cache) => api_unavailable("authorization backend unavailable", cache),
        AuthzError::AbnormalEnvironment(environment_id) => {
            tracing::warn!(environment_id, "deploy check on environment without cached ancestry");
            api_error(
                StatusCode::BAD_REQUEST,
                "abnormal_environment",
                "current environment data is abnormal, please contact the administrator",
            )
        }
    }
}
