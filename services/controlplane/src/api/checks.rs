//! Caller-facing authorization queries.
//!
//! These endpoints answer for the calling user only; they never reveal another
//! user's roles.
use crate::api::error::{ApiError, api_authz_error, api_validation_error};
use crate::api::middleware::CurrentUser;
use crate::api::types::{AuthorityResponse, NamespaceCheckRequest, ResourceCheckRequest};
use crate::app::AppState;
use crate::authz::{Action, Decision};
use axum::extract::State;
use axum::http::Method;
use axum::{Extension, Json};

fn action_of(method: Option<&str>) -> Result<Action, ApiError> {
    match method {
        None => Ok(Action::Read),
        Some(value) => value
            .to_ascii_uppercase()
            .parse::<Method>()
            .map(|method| Action::from_method(&method))
            .map_err(|_| api_validation_error(&format!("invalid method: {value}"))),
    }
}

/// `GET /v1/users/me/authority`
pub(crate) async fn my_authority(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<AuthorityResponse>, ApiError> {
    let authority = state
        .checker
        .authority(&user)
        .await
        .map_err(|err| api_authz_error(&err))?;
    Ok(Json(AuthorityResponse {
        username: user.username,
        system_admin: authority.is_system_admin(),
        authority,
    }))
}

/// `POST /v1/authz/check`: decide without performing the action.
pub(crate) async fn check_resource(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ResourceCheckRequest>,
) -> Result<Json<Decision>, ApiError> {
    let action = action_of(request.method.as_deref())?;
    let decision = state
        .checker
        .check_by_resource(&user, request.kind, request.id, action)
        .await
        .map_err(|err| api_authz_error(&err))?;
    Ok(Json(decision))
}

/// `POST /v1/authz/check-namespace`
pub(crate) async fn check_namespace(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<NamespaceCheckRequest>,
) -> Result<Json<Decision>, ApiError> {
    let action = action_of(request.method.as_deref())?;
    let decision = state
        .checker
        .check_by_cluster_namespace(&user, &request.cluster, &request.namespace, action)
        .await
        .map_err(|err| api_authz_error(&err))?;
    Ok(Json(decision))
}

/// Reached only through `deploy_gate`; echoes the decision that admitted the
/// caller so the deploy pipeline can tag its audit record.
pub(crate) async fn deploy(Extension(decision): Extension<Decision>) -> Json<Decision> {
    Json(decision)
}
