//! Cascading permission decisions over the resource tree.
//!
//! # Algorithm
//! 1. A system admin is allowed everything.
//! 2. The target's ancestor chain is resolved root-first. A target unknown to
//!    the cache is outside the governed hierarchy and is allowed.
//! 3. The chain is walked from the outermost scope inward. At each scope the
//!    caller must hold a role; a role that grants mutation at that scope
//!    allows immediately, any role allows a read, and a non-mutating role on a
//!    mutation defers to the next narrower scope.
//! 4. A mutation that reaches the end of the chain is denied.
//!
//! Denial is a normal outcome carried in [`Decision`]. Only infrastructure
//! failures are errors, and callers treat them as deny. A decision always
//! names the requested resource, never the enclosing scope that decided it,
//! so a denial does not reveal ancestors the caller cannot see.
use super::{AuthzError, AuthzResult};
use crate::cache::ModelCache;
use crate::model::{
    Entity, Kind, ROLE_PROJECT_ADMIN, ROLE_PROJECT_OPS, ROLE_SYSTEM_ADMIN, User, UserAuthority,
    role_grants_mutation,
};
use axum::http::Method;
use serde::Serialize;
use std::sync::Arc;

/// Read-only methods never mutate; everything else is treated as a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Mutate,
}

impl Action {
    pub fn from_method(method: &Method) -> Self {
        if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
            Action::Read
        } else {
            Action::Mutate
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Role that decided the outcome, used for audit tagging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_kind: Option<Kind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
}

impl Decision {
    fn allow(role: Option<&str>, object: Option<&Entity>) -> Self {
        Self {
            allowed: true,
            matched_role: role.map(str::to_string),
            object_kind: object.map(|entity| entity.kind),
            object_name: object.map(|entity| entity.name.clone()),
        }
    }

    fn deny(role: Option<&str>, object: Option<&Entity>) -> Self {
        Self {
            allowed: false,
            ..Self::allow(role, object)
        }
    }

    /// Names only the denied scope, never other parts of the topology.
    pub fn denial_message(&self) -> String {
        match (&self.object_kind, &self.object_name) {
            (Some(kind), Some(name)) => {
                format!("you have no permission to operate the {kind} {name}")
            }
            _ => "you have no permission to do this".to_string(),
        }
    }
}

/// Pure decision over a resolved chain (root-first).
pub fn cascade(authority: &UserAuthority, chain: &[Entity], action: Action) -> Decision {
    let target = chain.last();
    if authority.is_system_admin() {
        return Decision::allow(Some(ROLE_SYSTEM_ADMIN), target);
    }
    if chain.is_empty() {
        return Decision::allow(None, None);
    }
    for entity in chain {
        let Some(role) = authority.resource_role(entity.kind, entity.id) else {
            tracing::debug!(scope = %entity.resource_ref(), "no role at enclosing scope");
            return Decision::deny(None, target);
        };
        if role_grants_mutation(entity.kind, role) || action == Action::Read {
            tracing::debug!(scope = %entity.resource_ref(), role, "scope decided");
            return Decision::allow(Some(role), target);
        }
    }
    let role = target.and_then(|entity| authority.resource_role(entity.kind, entity.id));
    Decision::deny(role, target)
}

fn record_decision(kind: &'static str, decision: &Decision) {
    let outcome = if decision.allowed { "allow" } else { "deny" };
    metrics::counter!("authz_decisions_total", "kind" => kind, "outcome" => outcome).increment(1);
}

#[derive(Clone)]
pub struct PermissionChecker {
    cache: Arc<dyn ModelCache>,
}

impl PermissionChecker {
    pub fn new(cache: Arc<dyn ModelCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<dyn ModelCache> {
        &self.cache
    }

    pub async fn authority(&self, user: &User) -> AuthzResult<UserAuthority> {
        Ok(self.cache.get_user_authority(user).await?)
    }

    pub async fn check_by_resource(
        &self,
        user: &User,
        kind: Kind,
        id: u64,
        action: Action,
    ) -> AuthzResult<Decision> {
        let authority = self.authority(user).await?;
        let decision = if authority.is_system_admin() {
            cascade(&authority, &[], action)
        } else {
            let chain = self.cache.find_parents(kind, id).await?;
            cascade(&authority, &chain, action)
        };
        record_decision(kind.as_str(), &decision);
        tracing::debug!(
            username = %user.username,
            %kind,
            id,
            allowed = decision.allowed,
            role = decision.matched_role.as_deref().unwrap_or(""),
            "resource permission checked"
        );
        Ok(decision)
    }

    /// An environment that cannot be resolved by `(cluster, namespace)` is
    /// denied, unlike an unknown `(kind, id)`.
    pub async fn check_by_cluster_namespace(
        &self,
        user: &User,
        cluster: &str,
        namespace: &str,
        action: Action,
    ) -> AuthzResult<Decision> {
        let authority = self.authority(user).await?;
        let decision = if authority.is_system_admin() {
            cascade(&authority, &[], action)
        } else {
            match self.cache.find_environment(cluster, namespace).await? {
                Some(environment) => {
                    let chain = self
                        .cache
                        .find_parents(environment.kind, environment.id)
                        .await?;
                    cascade(&authority, &chain, action)
                }
                None => {
                    tracing::debug!(cluster, namespace, "namespace not bound to an environment");
                    Decision::deny(None, None)
                }
            }
        };
        record_decision(Kind::Environment.as_str(), &decision);
        Ok(decision)
    }

    pub async fn is_system_admin(&self, user: &User) -> AuthzResult<bool> {
        let allowed = self.authority(user).await?.is_system_admin();
        record_decision("system", &self.gate(allowed, ROLE_SYSTEM_ADMIN));
        Ok(allowed)
    }

    /// System admins pass as well.
    pub async fn is_any_tenant_admin(&self, user: &User) -> AuthzResult<bool> {
        let authority = self.authority(user).await?;
        let allowed = authority.is_system_admin() || authority.is_any_tenant_admin();
        record_decision(Kind::Tenant.as_str(), &self.gate(allowed, "admin"));
        Ok(allowed)
    }

    /// System admins pass as well.
    pub async fn is_any_virtual_space_admin(&self, user: &User) -> AuthzResult<bool> {
        let authority = self.authority(user).await?;
        let allowed = authority.is_system_admin() || authority.is_any_virtual_space_admin();
        record_decision(Kind::VirtualSpace.as_str(), &self.gate(allowed, "admin"));
        Ok(allowed)
    }

    fn gate(&self, allowed: bool, role: &str) -> Decision {
        if allowed {
            Decision::allow(Some(role), None)
        } else {
            Decision::deny(None, None)
        }
    }

    /// Deploy is allowed to a tenant admin, a project admin or ops member, or
    /// an environment operator anywhere along the environment's chain. An
    /// environment missing from the cache is an error, never an allow.
    pub async fn can_deploy_environment(
        &self,
        user: &User,
        environment_id: u64,
    ) -> AuthzResult<Decision> {
        let authority = self.authority(user).await?;
        if authority.is_system_admin() {
            let decision = Decision::allow(Some(ROLE_SYSTEM_ADMIN), None);
            record_decision("deploy", &decision);
            return Ok(decision);
        }
        let chain = self
            .cache
            .find_parents(Kind::Environment, environment_id)
            .await?;
        if chain.is_empty() {
            return Err(AuthzError::AbnormalEnvironment(environment_id));
        }
        let decision = deploy_decision(&authority, &chain);
        record_decision("deploy", &decision);
        Ok(decision)
    }
}

fn deploy_decision(authority: &UserAuthority, chain: &[Entity]) -> Decision {
    for entity in chain {
        let role = authority.resource_role(entity.kind, entity.id);
        let allowed = match (entity.kind, role) {
            (Kind::Tenant, Some(role)) => role_grants_mutation(Kind::Tenant, role),
            (Kind::Project, Some(role)) => role == ROLE_PROJECT_ADMIN || role == ROLE_PROJECT_OPS,
            (Kind::Environment, Some(role)) => role_grants_mutation(Kind::Environment, role),
            _ => false,
        };
        if allowed {
            tracing::debug!(scope = %entity.resource_ref(), "deploy scope decided");
            return Decision::allow(role, chain.last());
        }
    }
    Decision::deny(None, chain.last())
}
