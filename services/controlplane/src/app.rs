//! Authorization service HTTP wiring.
//!
//! # Purpose
//! Builds the Axum router, attaches the permission gates to each route group,
//! and defines the shared state injected into handlers and gates.
//!
//! # Notes
//! Gates are attached with `route_layer` so they only run for matched routes
//! and can read the matched path parameters.
use crate::api;
use crate::api::middleware::{deploy_gate, resource_gate, system_admin_gate};
use crate::authz::PermissionChecker;
use crate::cache::ModelCache;
use crate::cache::memory::ExpiringLru;
use crate::model::User;
use crate::observability;
use crate::store::RecordStore;
use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

const USER_CACHE_CAPACITY: usize = 1024;
const USER_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub cache: Arc<dyn ModelCache>,
    pub checker: PermissionChecker,
    /// Resolved callers by username, so a request does not always cost a
    /// record-store round trip.
    pub users: Arc<ExpiringLru<User>>,
}

impl AppState {
    pub fn new(records: Arc<dyn RecordStore>, cache: Arc<dyn ModelCache>) -> Self {
        let checker = PermissionChecker::new(cache.clone());
        Self {
            records,
            cache,
            checker,
            users: Arc::new(ExpiringLru::new(USER_CACHE_CAPACITY, USER_CACHE_TTL)),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    let scoped = Router::new()
        .route("/v1/tenants/:tenant_id", get(api::resources::get_tenant))
        .route(
            "/v1/tenants/:tenant_id/parents",
            get(api::resources::tenant_parents),
        )
        .route(
            "/v1/tenants/:tenant_id/children",
            get(api::resources::tenant_children),
        )
        .route("/v1/projects/:project_id", get(api::resources::get_project))
        .route(
            "/v1/projects/:project_id/parents",
            get(api::resources::project_parents),
        )
        .route(
            "/v1/projects/:project_id/children",
            get(api::resources::project_children),
        )
        .route(
            "/v1/environments/:environment_id",
            get(api::resources::get_environment),
        )
        .route(
            "/v1/environments/:environment_id/parents",
            get(api::resources::environment_parents),
        )
        .route(
            "/v1/virtualspaces/:virtualspace_id",
            get(api::resources::get_virtual_space),
        )
        .route(
            "/v1/virtualspaces/:virtualspace_id/parents",
            get(api::resources::virtual_space_parents),
        )
        .route(
            "/v1/clusters/:cluster/namespaces/:namespace",
            get(api::resources::get_namespace_environment),
        )
        .route_layer(from_fn_with_state(state.clone(), resource_gate));

    let deploys = Router::new()
        .route(
            "/v1/environments/:environment_id/deploy",
            post(api::checks::deploy),
        )
        .route("/v1/projects/:project_id/deploy", post(api::checks::deploy))
        .route_layer(from_fn_with_state(state.clone(), deploy_gate));

    let topology = Router::new()
        .route(
            "/v1/topology/tenants/:tenant_id",
            put(api::topology::put_tenant).delete(api::topology::delete_tenant),
        )
        .route(
            "/v1/topology/projects/:project_id",
            put(api::topology::put_project).delete(api::topology::delete_project),
        )
        .route(
            "/v1/topology/environments/:environment_id",
            put(api::topology::put_environment).delete(api::topology::delete_environment),
        )
        .route(
            "/v1/topology/virtualspaces/:virtualspace_id",
            put(api::topology::put_virtual_space).delete(api::topology::delete_virtual_space),
        )
        .route(
            "/v1/users/:username/authority/invalidate",
            post(api::topology::invalidate_authority),
        )
        .route_layer(from_fn_with_state(state.clone(), system_admin_gate));

    Router::new()
        .route("/v1/system/health", get(api::system::system_health))
        .route("/v1/users/me/authority", get(api::checks::my_authority))
        .route("/v1/authz/check", post(api::checks::check_resource))
        .route(
            "/v1/authz/check-namespace",
            post(api::checks::check_namespace),
        )
        .merge(scoped)
        .merge(deploys)
        .merge(topology)
        .layer(trace_layer)
        .with_state(state)
}
