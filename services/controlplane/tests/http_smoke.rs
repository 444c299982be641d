mod common;

use axum::http::StatusCode;
use common::{ENVIRONMENT, PROJECT, read_json, seeded_records, short_ttl_config};
use controlplane::app::{AppState, build_router};
use controlplane::cache::ModelCache;
use controlplane::cache::memory::InMemoryModelCache;
use controlplane::store::memory::InMemoryRecordStore;
use http_helpers::{json_request, request};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

type App = axum::routing::RouterIntoService<axum::body::Body, ()>;

async fn app() -> (Arc<InMemoryRecordStore>, App) {
    let records = seeded_records().await;
    let cache: Arc<dyn ModelCache> = Arc::new(InMemoryModelCache::new(
        records.clone(),
        &short_ttl_config(Duration::from_secs(60)),
    ));
    cache.build_if_not_exist().await.expect("build");
    let state = AppState::new(records.clone(), cache);
    (records, build_router(state).into_service())
}

async fn call(app: &App, req: axum::http::Request<axum::body::Body>) -> axum::response::Response {
    app.clone().oneshot(req).await.expect("response")
}

#[tokio::test]
async fn health_reports_backends_without_identity() {
    let (_, app) = app().await;
    let response = call(&app, request("GET", "/v1/system/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["records_backend"], "memory");
    assert_eq!(body["cache_backend"], "memory");
}

#[tokio::test]
async fn health_fails_when_records_unavailable() {
    let (records, app) = app().await;
    records.set_available(false);
    let response = call(&app, request("GET", "/v1/system/health", None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn missing_or_unknown_identity_is_rejected() {
    let (records, app) = app().await;
    let response = call(&app, request("GET", "/v1/projects/5", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = read_json(response).await;
    assert_eq!(body["message"], "please login first");

    let response = call(&app, request("GET", "/v1/projects/5", Some("mallory"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    records.set_available(false);
    let response = call(&app, request("GET", "/v1/projects/5", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn resolved_caller_is_reused_across_requests() {
    let (records, app) = app().await;
    let response = call(&app, request("GET", "/v1/projects/5", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Identity comes from the caller cache; authority is already cached too.
    records.set_available(false);
    let response = call(&app, request("GET", "/v1/projects/5", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = call(&app, request("GET", "/v1/projects/5", Some("carol"))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn environment_operator_without_tenant_role_is_denied_reads() {
    let (_, app) = app().await;
    let response = call(&app, request("GET", "/v1/environments/10", Some("bob"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = read_json(response).await;
    assert_eq!(body["code"], "forbidden");
    assert_eq!(
        body["message"],
        "you have no permission to operate the environment dev"
    );
    let message = body["message"].as_str().expect("message");
    assert!(!message.contains("tenant-one"), "{message}");

    let check = json_request(
        "POST",
        "/v1/authz/check",
        "bob",
        serde_json::json!({ "kind": "environment", "id": ENVIRONMENT, "method": "POST" }),
    );
    let response = call(&app, check).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["objectKind"], "environment");
    assert_eq!(body["objectName"], "dev");
}

#[tokio::test]
async fn tenant_admin_reads_nested_resources() {
    let (_, app) = app().await;
    let response = call(&app, request("GET", "/v1/environments/10", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["name"], "dev");
    assert_eq!(body["cluster"], "c1");

    let response = call(
        &app,
        request("GET", "/v1/environments/10/parents", Some("alice")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    let kinds: Vec<&str> = body["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["kind"].as_str().expect("kind"))
        .collect();
    assert_eq!(kinds, vec!["tenant", "project", "environment"]);

    let response = call(&app, request("GET", "/v1/projects/5/children", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["items"].as_array().expect("items").len(), 2);

    let check = json_request(
        "POST",
        "/v1/authz/check",
        "alice",
        serde_json::json!({ "kind": "environment", "id": ENVIRONMENT, "method": "DELETE" }),
    );
    let body = read_json(call(&app, check).await).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["matchedRole"], "admin");
}

#[tokio::test]
async fn ordinary_member_reads_but_cannot_write() {
    let (_, app) = app().await;
    let response = call(&app, request("GET", "/v1/projects/5", Some("carol"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let check = json_request(
        "POST",
        "/v1/authz/check",
        "carol",
        serde_json::json!({ "kind": "project", "id": PROJECT, "method": "POST" }),
    );
    let body = read_json(call(&app, check).await).await;
    assert_eq!(body["allowed"], false);

    let check = json_request(
        "POST",
        "/v1/authz/check",
        "carol",
        serde_json::json!({ "kind": "project", "id": PROJECT, "method": "not a method" }),
    );
    assert_eq!(call(&app, check).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn namespace_routes_resolve_through_environment() {
    let (_, app) = app().await;
    let response = call(
        &app,
        request("GET", "/v1/clusters/c1/namespaces/ns-dev", Some("alice")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["id"], ENVIRONMENT);

    let response = call(
        &app,
        request("GET", "/v1/clusters/c1/namespaces/ns-dev", Some("bob")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = call(
        &app,
        request("GET", "/v1/clusters/c1/namespaces/ns-unknown", Some("alice")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let check = json_request(
        "POST",
        "/v1/authz/check-namespace",
        "erin",
        serde_json::json!({ "cluster": "c1", "namespace": "ns-dev" }),
    );
    let body = read_json(call(&app, check).await).await;
    assert_eq!(body["allowed"], true);
}

#[tokio::test]
async fn wildcard_listings_require_admin_roles() {
    let (_, app) = app().await;
    let response = call(&app, request("GET", "/v1/tenants/_all", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_json(response).await["items"]
            .as_array()
            .expect("items")
            .len(),
        2
    );

    let response = call(&app, request("GET", "/v1/tenants/_all", Some("carol"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = call(&app, request("GET", "/v1/virtualspaces/_all", Some("erin"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = call(&app, request("GET", "/v1/virtualspaces/_all", Some("root"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = call(&app, request("GET", "/v1/tenants/abc", Some("root"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deploy_gate_applies_deploy_rules() {
    let (_, app) = app().await;
    let response = call(
        &app,
        request("POST", "/v1/environments/10/deploy", Some("bob")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["matchedRole"], "operator");

    let response = call(
        &app,
        request("POST", "/v1/environments/10/deploy", Some("erin")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        read_json(response).await["message"],
        "you have no permission to deploy in the current environment"
    );

    let response = call(
        &app,
        request(
            "POST",
            "/v1/projects/5/deploy?environment_id=999",
            Some("alice"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "abnormal_environment");

    let response = call(&app, request("POST", "/v1/projects/5/deploy", Some("dave"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = call(&app, request("POST", "/v1/projects/5/deploy", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn topology_hooks_are_system_admin_only() {
    let (_, app) = app().await;
    let put = json_request(
        "PUT",
        "/v1/topology/tenants/7",
        "alice",
        serde_json::json!({ "name": "tenant-seven" }),
    );
    let response = call(&app, put).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let put = json_request(
        "PUT",
        "/v1/topology/tenants/7",
        "root",
        serde_json::json!({ "name": "tenant-seven" }),
    );
    let response = call(&app, put).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["changed"], true);

    let response = call(&app, request("GET", "/v1/tenants/7", Some("root"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["name"], "tenant-seven");

    let put = json_request(
        "PUT",
        "/v1/topology/environments/70",
        "root",
        serde_json::json!({ "project_id": PROJECT, "name": "e70", "cluster": "", "namespace": "ns" }),
    );
    assert_eq!(call(&app, put).await.status(), StatusCode::BAD_REQUEST);

    let response = call(
        &app,
        request("DELETE", "/v1/topology/tenants/7", Some("root")),
    )
    .await;
    assert_eq!(read_json(response).await["changed"], true);
    let response = call(&app, request("GET", "/v1/tenants/7", Some("root"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn membership_change_is_visible_after_invalidation() {
    let (records, app) = app().await;
    let response = call(&app, request("GET", "/v1/users/me/authority", Some("carol"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["system_admin"], false);
    assert_eq!(body["authority"]["tenants"][0]["role"], "ordinary");

    records
        .add_membership(4, controlplane::model::Kind::Tenant, 1, "admin")
        .await;
    let response = call(
        &app,
        request("POST", "/v1/users/carol/authority/invalidate", Some("carol")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = call(
        &app,
        request("POST", "/v1/users/carol/authority/invalidate", Some("root")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let body = read_json(call(&app, request("GET", "/v1/users/me/authority", Some("carol"))).await).await;
    assert_eq!(body["authority"]["tenants"][0]["role"], "admin");
    assert_eq!(body["authority"]["tenants"][0]["isAdmin"], true);
}
