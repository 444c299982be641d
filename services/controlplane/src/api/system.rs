//! System/health API handlers.
//!
//! # Key invariants and assumptions
//! - Health checks must be fast and side-effect free.
//! - Health is ungated; it reveals only backend names.
use crate::api::error::{ApiError, api_unavailable};
use crate::api::types::HealthStatus;
use crate::app::AppState;
use axum::Json;
use axum::extract::State;

/// Probe the system of record and report which backends are wired.
///
/// # Errors
/// - Returns 503 if the record store health check fails.
pub(crate) async fn system_health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, ApiError> {
    if let Err(err) = state.records.health_check().await {
        return Err(api_unavailable("storage unavailable", &err));
    }
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
        records_backend: state.records.backend_name().to_string(),
        cache_backend: state.cache.backend_name().to_string(),
    }))
}
