//! Gated read endpoints over the resource tree.
//!
//! Every route here sits behind `resource_gate`; handlers only look things up.
use crate::api::error::{ApiError, api_cache_error, api_not_found, api_unavailable, api_validation_error};
use crate::api::middleware::ALL;
use crate::api::types::{EntityList, ResourceSummary, ResourceSummaryList};
use crate::app::AppState;
use crate::model::{Entity, Kind};
use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};

fn parse_id(value: &str) -> Result<u64, ApiError> {
    value
        .parse()
        .map_err(|_| api_validation_error(&format!("invalid id: {value}")))
}

async fn find_one(state: &AppState, kind: Kind, id: &str) -> Result<Json<Entity>, ApiError> {
    let id = parse_id(id)?;
    state
        .cache
        .find_resource(kind, id)
        .await
        .map_err(|err| api_cache_error("resource lookup failed", &err))?
        .map(Json)
        .ok_or_else(|| api_not_found(&format!("{kind} {id} not found")))
}

async fn parents_of(state: &AppState, kind: Kind, id: &str) -> Result<Json<EntityList>, ApiError> {
    let id = parse_id(id)?;
    let items = state
        .cache
        .find_parents(kind, id)
        .await
        .map_err(|err| api_cache_error("ancestor lookup failed", &err))?;
    if items.is_empty() {
        return Err(api_not_found(&format!("{kind} {id} not found")));
    }
    Ok(Json(EntityList { items }))
}

async fn children_of(state: &AppState, kind: Kind, id: &str) -> Result<Json<EntityList>, ApiError> {
    let id = parse_id(id)?;
    let items = state
        .cache
        .find_children(kind, id)
        .await
        .map_err(|err| api_cache_error("child lookup failed", &err))?;
    Ok(Json(EntityList { items }))
}

/// `GET /v1/tenants/:tenant_id`. With `_all`, lists every tenant from the
/// system of record (tenant admins only, enforced by the gate).
pub(crate) async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    if tenant_id == ALL {
        let tenants = state
            .records
            .list_tenants()
            .await
            .map_err(|err| api_unavailable("tenant listing failed", &err))?;
        let items = tenants
            .into_iter()
            .map(|tenant| ResourceSummary {
                id: tenant.id,
                name: tenant.name,
            })
            .collect();
        return Ok(Json(ResourceSummaryList { items }).into_response());
    }
    Ok(find_one(&state, Kind::Tenant, &tenant_id).await?.into_response())
}

pub(crate) async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Entity>, ApiError> {
    find_one(&state, Kind::Project, &project_id).await
}

pub(crate) async fn get_environment(
    State(state): State<AppState>,
    Path(environment_id): Path<String>,
) -> Result<Json<Entity>, ApiError> {
    find_one(&state, Kind::Environment, &environment_id).await
}

/// `GET /v1/virtualspaces/:virtualspace_id`. With `_all`, lists every
/// virtual space (system admins only).
pub(crate) async fn get_virtual_space(
    State(state): State<AppState>,
    Path(virtualspace_id): Path<String>,
) -> Result<Response, ApiError> {
    if virtualspace_id == ALL {
        let spaces = state
            .records
            .list_virtual_spaces()
            .await
            .map_err(|err| api_unavailable("virtual space listing failed", &err))?;
        let items = spaces
            .into_iter()
            .map(|space| ResourceSummary {
                id: space.id,
                name: space.name,
            })
            .collect();
        return Ok(Json(ResourceSummaryList { items }).into_response());
    }
    Ok(find_one(&state, Kind::VirtualSpace, &virtualspace_id)
        .await?
        .into_response())
}

pub(crate) async fn get_namespace_environment(
    State(state): State<AppState>,
    Path((cluster, namespace)): Path<(String, String)>,
) -> Result<Json<Entity>, ApiError> {
    state
        .cache
        .find_environment(&cluster, &namespace)
        .await
        .map_err(|err| api_cache_error("environment lookup failed", &err))?
        .map(Json)
        .ok_or_else(|| api_not_found("namespace is not bound to an environment"))
}

pub(crate) async fn tenant_parents(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<EntityList>, ApiError> {
    parents_of(&state, Kind::Tenant, &tenant_id).await
}

pub(crate) async fn project_parents(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<EntityList>, ApiError> {
    parents_of(&state, Kind::Project, &project_id).await
}

pub(crate) async fn environment_parents(
    State(state): State<AppState>,
    Path(environment_id): Path<String>,
) -> Result<Json<EntityList>, ApiError> {
    parents_of(&state, Kind::Environment, &environment_id).await
}

pub(crate) async fn virtual_space_parents(
    State(state): State<AppState>,
    Path(virtualspace_id): Path<String>,
) -> Result<Json<EntityList>, ApiError> {
    parents_of(&state, Kind::VirtualSpace, &virtualspace_id).await
}

pub(crate) async fn tenant_children(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<EntityList>, ApiError> {
    children_of(&state, Kind::Tenant, &tenant_id).await
}

pub(crate) async fn project_children(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<EntityList>, ApiError> {
    children_of(&state, Kind::Project, &project_id).await
}
