//! Caller identity and permission gates.
//!
//! # Purpose and responsibility
//! Gates run as route layers in front of handlers. They resolve the caller,
//! pick the target scope from the matched path parameters, and abort with 403
//! on deny. The decision that let a request through is stored in the request
//! extensions for audit tagging.
//!
//! # Security considerations
//! - Identity comes from the `x-gems-user` header set by the authenticating
//!   proxy in front of this service. Requests without it are rejected.
//! - Any error while deciding is a 503; nothing fails open except a resource
//!   unknown to the cache, which the checker allows by design of the cascade.
use crate::api::error::{
    ApiError, api_authz_error, api_forbidden, api_unauthorized, api_unavailable,
    api_validation_error,
};
use crate::app::AppState;
use crate::authz::{Action, Decision};
use crate::model::{Kind, User};
use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;

pub const USER_HEADER: &str = "x-gems-user";

/// Wildcard id that addresses every resource of a kind.
pub const ALL: &str = "_all";

/// The authenticated caller, resolved against the system of record.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        if let Some(user) = parts.extensions.get::<CurrentUser>() {
            return Ok(user.clone());
        }
        let username = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| api_unauthorized("please login first"))?;
        let user = match state.users.get(username) {
            Some(user) => user,
            None => {
                let user = state
                    .records
                    .get_user(username)
                    .await
                    .map_err(|err| api_unavailable("user lookup failed", &err))?
                    .ok_or_else(|| api_unauthorized("unknown user"))?;
                state.users.insert(username.to_string(), user.clone());
                user
            }
        };
        let current = CurrentUser(user);
        parts.extensions.insert(current.clone());
        Ok(current)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum GateTarget {
    AllTenants,
    AllVirtualSpaces,
    Resource(Kind, u64),
    Namespace(String, String),
}

fn parse_id(name: &str, value: &str) -> Result<u64, ApiError> {
    value
        .parse()
        .map_err(|_| api_validation_error(&format!("invalid {name}: {value}")))
}

/// The narrowest scope named by the matched route.
fn gate_target(params: &HashMap<String, String>) -> Result<GateTarget, ApiError> {
    if let (Some(cluster), Some(namespace)) = (params.get("cluster"), params.get("namespace")) {
        return Ok(GateTarget::Namespace(cluster.clone(), namespace.clone()));
    }
    if let Some(value) = params.get("environment_id") {
        return Ok(GateTarget::Resource(
            Kind::Environment,
            parse_id("environment_id", value)?,
        ));
    }
    if let Some(value) = params.get("project_id") {
        return Ok(GateTarget::Resource(
            Kind::Project,
            parse_id("project_id", value)?,
        ));
    }
    if let Some(value) = params.get("tenant_id") {
        if value == ALL {
            return Ok(GateTarget::AllTenants);
        }
        return Ok(GateTarget::Resource(Kind::Tenant, parse_id("tenant_id", value)?));
    }
    if let Some(value) = params.get("virtualspace_id") {
        if value == ALL {
            return Ok(GateTarget::AllVirtualSpaces);
        }
        return Ok(GateTarget::Resource(
            Kind::VirtualSpace,
            parse_id("virtualspace_id", value)?,
        ));
    }
    Err(api_validation_error("route names no resource to authorize"))
}

fn wildcard_decision(allowed: bool, role: &str) -> Decision {
    Decision {
        allowed,
        matched_role: allowed.then(|| role.to_string()),
        object_kind: None,
        object_name: None,
    }
}

/// Authorize the caller on the scope named by the path: tenant, project,
/// environment, virtual space, or cluster + namespace.
pub async fn resource_gate(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    CurrentUser(user): CurrentUser,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let action = Action::from_method(request.method());
    let checker = &state.checker;
    let decision = match gate_target(&params)? {
        GateTarget::AllTenants => {
            let allowed = checker
                .is_any_tenant_admin(&user)
                .await
                .map_err(|err| api_authz_error(&err))?;
            wildcard_decision(allowed, "admin")
        }
        GateTarget::AllVirtualSpaces => {
            let allowed = checker
                .is_system_admin(&user)
                .await
                .map_err(|err| api_authz_error(&err))?;
            wildcard_decision(allowed, "sysadmin")
        }
        GateTarget::Resource(kind, id) => checker
            .check_by_resource(&user, kind, id, action)
            .await
            .map_err(|err| api_authz_error(&err))?,
        GateTarget::Namespace(cluster, namespace) => checker
            .check_by_cluster_namespace(&user, &cluster, &namespace, action)
            .await
            .map_err(|err| api_authz_error(&err))?,
    };
    if !decision.allowed {
        tracing::info!(username = %user.username, method = %request.method(), uri = %request.uri(), "request denied");
        return Err(api_forbidden(&decision.denial_message()));
    }
    request.extensions_mut().insert(CurrentUser(user));
    request.extensions_mut().insert(decision);
    Ok(next.run(request).await)
}

/// Authorize a deployment. Uses the environment id from the path or the
/// `environment_id` query parameter, falling back to the project check when
/// neither is present.
pub async fn deploy_gate(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    CurrentUser(user): CurrentUser,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let checker = &state.checker;
    let environment_id = params
        .get("environment_id")
        .or_else(|| query.get("environment_id"))
        .map(|value| parse_id("environment_id", value))
        .transpose()?;
    let decision = match (environment_id, params.get("project_id")) {
        (Some(environment_id), _) => {
            let decision = checker
                .can_deploy_environment(&user, environment_id)
                .await
                .map_err(|err| api_authz_error(&err))?;
            if !decision.allowed {
                return Err(api_forbidden(
                    "you have no permission to deploy in the current environment",
                ));
            }
            decision
        }
        (None, Some(project_id)) => {
            let project_id = parse_id("project_id", project_id)?;
            let action = Action::from_method(request.method());
            let decision = checker
                .check_by_resource(&user, Kind::Project, project_id, action)
                .await
                .map_err(|err| api_authz_error(&err))?;
            if !decision.allowed {
                return Err(api_forbidden(&decision.denial_message()));
            }
            decision
        }
        (None, None) => return Err(api_validation_error("environment_id is required")),
    };
    request.extensions_mut().insert(CurrentUser(user));
    request.extensions_mut().insert(decision);
    Ok(next.run(request).await)
}

/// Only system administrators pass.
pub async fn system_admin_gate(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let allowed = state
        .checker
        .is_system_admin(&user)
        .await
        .map_err(|err| api_authz_error(&err))?;
    if !allowed {
        return Err(api_forbidden("only the system administrator can do this"));
    }
    request.extensions_mut().insert(CurrentUser(user));
    request
        .extensions_mut()
        .insert(wildcard_decision(true, "sysadmin"));
    Ok(next.run(request).await)
}
