//! Topology write-through hooks.
//!
//! # Purpose and responsibility
//! Services that own the tenant/project/environment/virtual-space tables call
//! these after committing a change so the cache follows the system of record.
//! Membership changes call the authority invalidation hook.
//!
//! # Security considerations
//! All routes sit behind `system_admin_gate`.
use crate::api::error::{ApiError, api_cache_error, api_validation_error};
use crate::api::types::{
    EnvironmentUpsertRequest, ProjectUpsertRequest, TenantUpsertRequest,
    VirtualSpaceUpsertRequest, WriteResult,
};
use crate::app::AppState;
use crate::cache::CacheResult;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

fn require_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(api_validation_error("name must not be empty"));
    }
    Ok(())
}

fn written(result: CacheResult<bool>) -> Result<Json<WriteResult>, ApiError> {
    result
        .map(|changed| Json(WriteResult { changed }))
        .map_err(|err| api_cache_error("model cache write failed", &err))
}

pub(crate) async fn put_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Json(body): Json<TenantUpsertRequest>,
) -> Result<Json<WriteResult>, ApiError> {
    require_name(&body.name)?;
    written(state.cache.upsert_tenant(tenant_id, &body.name).await)
}

pub(crate) async fn delete_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
) -> Result<Json<WriteResult>, ApiError> {
    written(state.cache.delete_tenant(tenant_id).await)
}

pub(crate) async fn put_project(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
    Json(body): Json<ProjectUpsertRequest>,
) -> Result<Json<WriteResult>, ApiError> {
    require_name(&body.name)?;
    written(
        state
            .cache
            .upsert_project(body.tenant_id, project_id, &body.name)
            .await,
    )
}

pub(crate) async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
) -> Result<Json<WriteResult>, ApiError> {
    written(state.cache.delete_project(project_id).await)
}

pub(crate) async fn put_environment(
    State(state): State<AppState>,
    Path(environment_id): Path<u64>,
    Json(body): Json<EnvironmentUpsertRequest>,
) -> Result<Json<WriteResult>, ApiError> {
    require_name(&body.name)?;
    if body.cluster.is_empty() || body.namespace.is_empty() {
        return Err(api_validation_error("cluster and namespace are required"));
    }
    written(
        state
            .cache
            .upsert_environment(
                body.project_id,
                environment_id,
                &body.name,
                &body.cluster,
                &body.namespace,
            )
            .await,
    )
}

pub(crate) async fn delete_environment(
    State(state): State<AppState>,
    Path(environment_id): Path<u64>,
) -> Result<Json<WriteResult>, ApiError> {
    written(state.cache.delete_environment(environment_id).await)
}

pub(crate) async fn put_virtual_space(
    State(state): State<AppState>,
    Path(virtualspace_id): Path<u64>,
    Json(body): Json<VirtualSpaceUpsertRequest>,
) -> Result<Json<WriteResult>, ApiError> {
    require_name(&body.name)?;
    written(
        state
            .cache
            .upsert_virtual_space(virtualspace_id, &body.name)
            .await,
    )
}

pub(crate) async fn delete_virtual_space(
    State(state): State<AppState>,
    Path(virtualspace_id): Path<u64>,
) -> Result<Json<WriteResult>, ApiError> {
    written(state.cache.delete_virtual_space(virtualspace_id).await)
}

/// Drop the cached authority and caller so the next check rebuilds both.
pub(crate) async fn invalidate_authority(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.users.remove(&username);
    state
        .cache
        .invalidate_user_authority(&username)
        .await
        .map_err(|err| api_cache_error("authority invalidation failed", &err))?;
    tracing::info!(%username, "user authority invalidated");
    Ok(StatusCode::NO_CONTENT)
}
