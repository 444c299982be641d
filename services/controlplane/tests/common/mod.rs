#![allow(dead_code)]

use controlplane::authz::{Action, PermissionChecker};
use controlplane::cache::{CacheConfig, ModelCache};
use controlplane::model::{Entity, Kind, ROLE_SYSTEM_ADMIN, ROLE_SYSTEM_NORMAL, User};
use controlplane::store::memory::InMemoryRecordStore;
use std::sync::Arc;
use std::time::Duration;

pub const TENANT: u64 = 1;
pub const OTHER_TENANT: u64 = 2;
pub const PROJECT: u64 = 5;
pub const ENVIRONMENT: u64 = 10;
pub const PROD_ENVIRONMENT: u64 = 11;
pub const UNBOUND_ENVIRONMENT: u64 = 12;
pub const VIRTUAL_SPACE: u64 = 3;

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

/// Tenant 1 > project 5 > environments 10 (c1/ns-dev) and 11 (c1/ns-prod),
/// plus an unbound environment, a second tenant, a virtual space, and one
/// user per role shape the tests need.
pub async fn seeded_records() -> Arc<InMemoryRecordStore> {
    let records = Arc::new(InMemoryRecordStore::new());
    records.insert_tenant(TENANT, "tenant-one").await;
    records.insert_tenant(OTHER_TENANT, "tenant-two").await;
    records.insert_project(TENANT, PROJECT, "payments").await;
    records
        .insert_environment(PROJECT, ENVIRONMENT, "dev", Some("c1"), "ns-dev")
        .await;
    records
        .insert_environment(PROJECT, PROD_ENVIRONMENT, "prod", Some("c1"), "ns-prod")
        .await;
    records
        .insert_environment(PROJECT, UNBOUND_ENVIRONMENT, "scratch", None, "ns-scratch")
        .await;
    records.insert_virtual_space(VIRTUAL_SPACE, "mesh").await;

    records.insert_user(1, "root", ROLE_SYSTEM_ADMIN).await;
    records.insert_user(2, "alice", ROLE_SYSTEM_NORMAL).await;
    records.insert_user(3, "bob", ROLE_SYSTEM_NORMAL).await;
    records.insert_user(4, "carol", ROLE_SYSTEM_NORMAL).await;
    records.insert_user(5, "dave", ROLE_SYSTEM_NORMAL).await;
    records.insert_user(6, "erin", ROLE_SYSTEM_NORMAL).await;

    records.add_membership(2, Kind::Tenant, TENANT, "admin").await;
    records
        .add_membership(3, Kind::Environment, ENVIRONMENT, "operator")
        .await;
    records.add_membership(4, Kind::Tenant, TENANT, "ordinary").await;
    records.add_membership(5, Kind::Project, PROJECT, "ops").await;
    records.add_membership(6, Kind::Tenant, TENANT, "ordinary").await;
    records.add_membership(6, Kind::Project, PROJECT, "dev").await;
    records
        .add_membership(6, Kind::Environment, ENVIRONMENT, "reader")
        .await;
    records
        .add_membership(6, Kind::VirtualSpace, VIRTUAL_SPACE, "normal")
        .await;
    records
}

pub fn short_ttl_config(ttl: Duration) -> CacheConfig {
    CacheConfig {
        authority_ttl: ttl,
        lock_timeout: Duration::from_secs(5),
        operation_timeout: Duration::from_secs(5),
        ..CacheConfig::default()
    }
}

pub fn user(id: u64, username: &str) -> User {
    let system_role = if username == "root" {
        ROLE_SYSTEM_ADMIN
    } else {
        ROLE_SYSTEM_NORMAL
    };
    User {
        id,
        username: username.to_string(),
        system_role: system_role.to_string(),
    }
}

fn kinds(chain: &[Entity]) -> Vec<(Kind, u64)> {
    chain.iter().map(|entity| (entity.kind, entity.id)).collect()
}

/// Behavior every `ModelCache` backend must share. Each function expects a
/// cache freshly built from [`seeded_records`].
pub mod suite {
    use super::*;

    pub async fn builds_once(cache: &dyn ModelCache) {
        assert!(!cache.build_if_not_exist().await.expect("second build"));
        let unbound = cache
            .find_resource(Kind::Environment, UNBOUND_ENVIRONMENT)
            .await
            .expect("lookup");
        assert!(unbound.is_none(), "unbound environments are not cached");
    }

    pub async fn ancestor_chain_is_root_first(cache: &dyn ModelCache) {
        let chain = cache
            .find_parents(Kind::Environment, ENVIRONMENT)
            .await
            .expect("parents");
        assert_eq!(
            kinds(&chain),
            vec![
                (Kind::Tenant, TENANT),
                (Kind::Project, PROJECT),
                (Kind::Environment, ENVIRONMENT)
            ]
        );

        let project_chain = cache
            .find_parents(Kind::Project, PROJECT)
            .await
            .expect("project parents");
        assert_eq!(
            kinds(&project_chain),
            vec![(Kind::Tenant, TENANT), (Kind::Project, PROJECT)]
        );

        let space = cache
            .find_parents(Kind::VirtualSpace, VIRTUAL_SPACE)
            .await
            .expect("virtual space parents");
        assert_eq!(kinds(&space), vec![(Kind::VirtualSpace, VIRTUAL_SPACE)]);

        assert!(
            cache
                .find_parents(Kind::Environment, 999)
                .await
                .expect("unknown")
                .is_empty()
        );
    }

    pub async fn chain_ends_with_queried_entity(cache: &dyn ModelCache) {
        for (kind, id) in [
            (Kind::Tenant, TENANT),
            (Kind::Project, PROJECT),
            (Kind::Environment, PROD_ENVIRONMENT),
        ] {
            let chain = cache.find_parents(kind, id).await.expect("parents");
            let resource = cache
                .find_resource(kind, id)
                .await
                .expect("resource")
                .expect("cached");
            assert_eq!(chain.last(), Some(&resource));
        }
    }

    pub async fn namespace_lookup_follows_moves(cache: &dyn ModelCache) {
        let found = cache
            .find_environment("c1", "ns-dev")
            .await
            .expect("lookup")
            .expect("bound");
        assert_eq!(found.id, ENVIRONMENT);
        assert_eq!(found.namespace.as_deref(), Some("ns-dev"));

        assert!(
            cache
                .upsert_environment(PROJECT, ENVIRONMENT, "dev", "c2", "ns-dev")
                .await
                .expect("move")
        );
        assert!(
            cache
                .find_environment("c1", "ns-dev")
                .await
                .expect("old key")
                .is_none()
        );
        let moved = cache
            .find_environment("c2", "ns-dev")
            .await
            .expect("new key")
            .expect("moved");
        assert_eq!(moved.id, ENVIRONMENT);
        assert_eq!(moved.cluster.as_deref(), Some("c2"));
    }

    /// Namespaces spelled like primary keys (`project_5`, `tenant_1`, or the
    /// tree lease `lock_model_cache`) only ever reach the namespace index.
    pub async fn namespace_key_cannot_shadow_primary_key(cache: Arc<dyn ModelCache>) {
        cache
            .upsert_environment(PROJECT, 13, "shadow-project", "project", "5")
            .await
            .expect("project-shaped namespace");
        cache
            .upsert_environment(PROJECT, 14, "shadow-tenant", "tenant", "1")
            .await
            .expect("tenant-shaped namespace");
        cache
            .upsert_environment(PROJECT, 15, "shadow-lock", "lock", "model_cache")
            .await
            .expect("lease-shaped namespace");

        let project = cache
            .find_resource(Kind::Project, PROJECT)
            .await
            .expect("project")
            .expect("cached");
        assert_eq!(project.kind, Kind::Project);
        assert_eq!(project.name, "payments");
        let tenant = cache
            .find_resource(Kind::Tenant, TENANT)
            .await
            .expect("tenant")
            .expect("cached");
        assert_eq!(tenant.name, "tenant-one");

        let chain = cache
            .find_parents(Kind::Environment, ENVIRONMENT)
            .await
            .expect("parents");
        assert_eq!(
            kinds(&chain),
            vec![
                (Kind::Tenant, TENANT),
                (Kind::Project, PROJECT),
                (Kind::Environment, ENVIRONMENT)
            ]
        );
        let shadow = cache
            .find_environment("project", "5")
            .await
            .expect("lookup")
            .expect("bound");
        assert_eq!(shadow.id, 13);

        // The tree lease is still free, so further writes go through.
        assert!(
            cache
                .upsert_environment(PROJECT, 15, "shadow-lock", "c1", "ns-lock")
                .await
                .expect("write after lease-shaped namespace")
        );

        let checker = PermissionChecker::new(cache);
        let decision = checker
            .check_by_resource(&user(3, "bob"), Kind::Environment, ENVIRONMENT, Action::Mutate)
            .await
            .expect("check");
        assert!(!decision.allowed, "tenant check still applies");
    }

    /// Moving an environment away must not unbind a namespace that another
    /// environment has taken over in the meantime.
    pub async fn rebound_namespace_survives_previous_holder_move(cache: &dyn ModelCache) {
        cache
            .upsert_environment(PROJECT, PROD_ENVIRONMENT, "prod", "c1", "ns-dev")
            .await
            .expect("rebind");
        cache
            .upsert_environment(PROJECT, ENVIRONMENT, "dev", "c1", "ns-moved")
            .await
            .expect("move previous holder");
        let bound = cache
            .find_environment("c1", "ns-dev")
            .await
            .expect("lookup")
            .expect("still bound");
        assert_eq!(bound.id, PROD_ENVIRONMENT);

        assert!(cache.delete_environment(ENVIRONMENT).await.expect("delete"));
        let bound = cache
            .find_environment("c1", "ns-dev")
            .await
            .expect("lookup")
            .expect("still bound after delete");
        assert_eq!(bound.id, PROD_ENVIRONMENT);
        assert!(
            cache
                .find_environment("c1", "ns-moved")
                .await
                .expect("moved key")
                .is_none()
        );
    }

    pub async fn deleting_tenant_orphans_descendants(cache: &dyn ModelCache) {
        assert!(cache.delete_tenant(TENANT).await.expect("delete"));
        assert!(!cache.delete_tenant(TENANT).await.expect("delete again"));
        assert!(
            cache
                .find_resource(Kind::Tenant, TENANT)
                .await
                .expect("tenant")
                .is_none()
        );
        assert!(
            cache
                .find_resource(Kind::Project, PROJECT)
                .await
                .expect("project")
                .is_some()
        );
        let chain = cache
            .find_parents(Kind::Environment, ENVIRONMENT)
            .await
            .expect("parents");
        assert_eq!(
            kinds(&chain),
            vec![(Kind::Project, PROJECT), (Kind::Environment, ENVIRONMENT)]
        );
    }

    pub async fn upsert_is_idempotent(cache: &dyn ModelCache) {
        assert!(
            cache
                .upsert_project(OTHER_TENANT, 6, "billing")
                .await
                .expect("first")
        );
        assert!(
            !cache
                .upsert_project(OTHER_TENANT, 6, "billing")
                .await
                .expect("second")
        );
        let tenant = cache
            .find_resource(Kind::Tenant, OTHER_TENANT)
            .await
            .expect("tenant")
            .expect("cached");
        let links = tenant
            .children
            .iter()
            .filter(|child| child.kind == Kind::Project && child.id == 6)
            .count();
        assert_eq!(links, 1);

        // Renaming keeps the children already collected under the project.
        assert!(
            cache
                .upsert_environment(6, 60, "qa", "c9", "ns-qa")
                .await
                .expect("child")
        );
        assert!(
            cache
                .upsert_project(OTHER_TENANT, 6, "billing-v2")
                .await
                .expect("rename")
        );
        let children = cache
            .find_children(Kind::Project, 6)
            .await
            .expect("children");
        assert_eq!(kinds(&children), vec![(Kind::Environment, 60)]);
    }

    pub async fn reparenting_moves_child_link(cache: &dyn ModelCache) {
        assert!(
            cache
                .upsert_project(OTHER_TENANT, PROJECT, "payments")
                .await
                .expect("move")
        );
        let old = cache
            .find_children(Kind::Tenant, TENANT)
            .await
            .expect("old owner");
        assert!(old.iter().all(|child| child.id != PROJECT));
        let new = cache
            .find_children(Kind::Tenant, OTHER_TENANT)
            .await
            .expect("new owner");
        assert!(new.iter().any(|child| child.id == PROJECT));
    }

    pub async fn cascading_deny_without_outer_role(cache: Arc<dyn ModelCache>) {
        let checker = PermissionChecker::new(cache);
        let bob = user(3, "bob");
        let decision = checker
            .check_by_resource(&bob, Kind::Environment, ENVIRONMENT, Action::Mutate)
            .await
            .expect("check");
        assert!(!decision.allowed);
        assert_eq!(decision.object_kind, Some(Kind::Environment));
        assert_eq!(decision.object_name.as_deref(), Some("dev"));
        assert!(!decision.denial_message().contains("tenant-one"));

        let dave = user(5, "dave");
        let read = checker
            .check_by_resource(&dave, Kind::Project, PROJECT, Action::Read)
            .await
            .expect("check");
        assert!(!read.allowed, "project role without tenant role is denied");
    }

    pub async fn tenant_admin_cascades_down(cache: Arc<dyn ModelCache>) {
        let checker = PermissionChecker::new(cache);
        let alice = user(2, "alice");
        let decision = checker
            .check_by_resource(&alice, Kind::Environment, ENVIRONMENT, Action::Mutate)
            .await
            .expect("check");
        assert!(decision.allowed);
        assert_eq!(decision.matched_role.as_deref(), Some("admin"));

        let by_namespace = checker
            .check_by_cluster_namespace(&alice, "c1", "ns-prod", Action::Mutate)
            .await
            .expect("namespace check");
        assert!(by_namespace.allowed);
        let unknown = checker
            .check_by_cluster_namespace(&alice, "c1", "ns-missing", Action::Read)
            .await
            .expect("unknown namespace");
        assert!(!unknown.allowed);
    }

    pub async fn ordinary_member_reads_only(cache: Arc<dyn ModelCache>) {
        let checker = PermissionChecker::new(cache);
        let carol = user(4, "carol");
        assert!(
            checker
                .check_by_resource(&carol, Kind::Project, PROJECT, Action::Read)
                .await
                .expect("read")
                .allowed
        );
        let write = checker
            .check_by_resource(&carol, Kind::Project, PROJECT, Action::Mutate)
            .await
            .expect("write");
        assert!(!write.allowed);
        assert_eq!(
            write.denial_message(),
            "you have no permission to operate the project payments"
        );
    }

    pub async fn deploy_rules(cache: Arc<dyn ModelCache>) {
        let checker = PermissionChecker::new(cache.clone());
        let dave = checker
            .can_deploy_environment(&user(5, "dave"), ENVIRONMENT)
            .await
            .expect("ops");
        assert!(dave.allowed);
        let bob = checker
            .can_deploy_environment(&user(3, "bob"), ENVIRONMENT)
            .await
            .expect("operator");
        assert!(bob.allowed);
        let erin = checker
            .can_deploy_environment(&user(6, "erin"), ENVIRONMENT)
            .await
            .expect("reader");
        assert!(!erin.allowed);
        assert!(
            checker
                .can_deploy_environment(&user(1, "root"), 999)
                .await
                .expect("sysadmin")
                .allowed
        );
        assert!(
            checker
                .can_deploy_environment(&user(2, "alice"), 999)
                .await
                .is_err(),
            "unknown environment is abnormal for non-admins"
        );
    }

    pub async fn authority_expires_and_rebuilds(
        cache: &dyn ModelCache,
        records: &InMemoryRecordStore,
        ttl: Duration,
    ) {
        let carol = user(4, "carol");
        let before = cache.get_user_authority(&carol).await.expect("authority");
        assert!(before.is_tenant_member(TENANT));
        assert!(!before.is_tenant_admin(TENANT));

        records.add_membership(4, Kind::Tenant, TENANT, "admin").await;
        let cached = cache.get_user_authority(&carol).await.expect("cached");
        assert!(!cached.is_tenant_admin(TENANT), "served from cache before expiry");

        tokio::time::sleep(ttl + Duration::from_millis(150)).await;
        let rebuilt = cache.get_user_authority(&carol).await.expect("rebuilt");
        assert!(rebuilt.is_tenant_admin(TENANT));

        records.remove_membership(4, Kind::Tenant, TENANT).await;
        cache
            .invalidate_user_authority("carol")
            .await
            .expect("invalidate");
        let after = cache.get_user_authority(&carol).await.expect("after");
        assert!(!after.is_tenant_member(TENANT));
    }

    pub async fn degraded_authority_is_not_cached(
        cache: &dyn ModelCache,
        records: &InMemoryRecordStore,
    ) {
        let erin = user(6, "erin");
        records.set_available(false);
        let degraded = cache.get_user_authority(&erin).await.expect("degraded");
        assert!(degraded.tenants.is_empty());
        records.set_available(true);
        let recovered = cache.get_user_authority(&erin).await.expect("recovered");
        assert!(recovered.is_tenant_member(TENANT));
        assert!(recovered.is_virtual_space_member(VIRTUAL_SPACE));
    }

    pub async fn concurrent_child_upserts_union(a: Arc<dyn ModelCache>, b: Arc<dyn ModelCache>) {
        let left = tokio::spawn(async move {
            for id in 100..110 {
                a.upsert_project(OTHER_TENANT, id, &format!("left-{id}"))
                    .await
                    .expect("left upsert");
            }
        });
        let right = tokio::spawn({
            let b = b.clone();
            async move {
                for id in 200..210 {
                    b.upsert_project(OTHER_TENANT, id, &format!("right-{id}"))
                        .await
                        .expect("right upsert");
                }
            }
        });
        left.await.expect("left task");
        right.await.expect("right task");

        let tenant = b
            .find_resource(Kind::Tenant, OTHER_TENANT)
            .await
            .expect("tenant")
            .expect("cached");
        let mut ids: Vec<u64> = tenant
            .children
            .iter()
            .filter(|child| child.kind == Kind::Project)
            .map(|child| child.id)
            .collect();
        ids.sort_unstable();
        let expected: Vec<u64> = (100..110).chain(200..210).collect();
        assert_eq!(ids, expected);
    }
}
