//! Per-user flattened role snapshot.
//!
//! # Purpose
//! `UserAuthority` is what the permission checker consults: the caller's system
//! role plus one list of `(id, name, role, isAdmin)` rows per scope kind. It is
//! serialized as JSON into the authority cache, so field names are stable.
use super::entity::Kind;
use serde::{Deserialize, Serialize};

pub const ROLE_SYSTEM_ADMIN: &str = "sysadmin";
pub const ROLE_SYSTEM_NORMAL: &str = "normal";

pub const ROLE_TENANT_ADMIN: &str = "admin";
pub const ROLE_TENANT_ORDINARY: &str = "ordinary";

pub const ROLE_PROJECT_ADMIN: &str = "admin";
pub const ROLE_PROJECT_DEV: &str = "dev";
pub const ROLE_PROJECT_TEST: &str = "test";
pub const ROLE_PROJECT_OPS: &str = "ops";

pub const ROLE_ENVIRONMENT_OPERATOR: &str = "operator";
pub const ROLE_ENVIRONMENT_READER: &str = "reader";

pub const ROLE_VIRTUAL_SPACE_ADMIN: &str = "admin";
pub const ROLE_VIRTUAL_SPACE_NORMAL: &str = "normal";

/// Whether `role` at a scope of `kind` permits mutation without consulting
/// narrower scopes.
pub fn role_grants_mutation(kind: Kind, role: &str) -> bool {
    match kind {
        Kind::Tenant => role == ROLE_TENANT_ADMIN,
        Kind::Project => role == ROLE_PROJECT_ADMIN || role == ROLE_PROJECT_OPS,
        Kind::Environment => role == ROLE_ENVIRONMENT_OPERATOR,
        Kind::VirtualSpace => role == ROLE_VIRTUAL_SPACE_ADMIN,
    }
}

/// The `isAdmin` flag stored alongside each membership row.
pub fn role_is_admin(kind: Kind, role: &str) -> bool {
    match kind {
        Kind::Tenant => role == ROLE_TENANT_ADMIN,
        Kind::Project => role == ROLE_PROJECT_ADMIN,
        Kind::Environment => role == ROLE_ENVIRONMENT_OPERATOR,
        Kind::VirtualSpace => role == ROLE_VIRTUAL_SPACE_ADMIN,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResource {
    pub id: u64,
    pub name: String,
    pub role: String,
    pub is_admin: bool,
}

impl UserResource {
    pub fn new(kind: Kind, id: u64, name: impl Into<String>, role: impl Into<String>) -> Self {
        let role = role.into();
        Self {
            id,
            name: name.into(),
            is_admin: role_is_admin(kind, &role),
            role,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAuthority {
    #[serde(default)]
    pub system_role: String,
    #[serde(default)]
    pub tenants: Vec<UserResource>,
    #[serde(default)]
    pub projects: Vec<UserResource>,
    #[serde(default)]
    pub environments: Vec<UserResource>,
    #[serde(default)]
    pub virtual_spaces: Vec<UserResource>,
}

impl UserAuthority {
    pub fn resources(&self, kind: Kind) -> &[UserResource] {
        match kind {
            Kind::Tenant => &self.tenants,
            Kind::Project => &self.projects,
            Kind::Environment => &self.environments,
            Kind::VirtualSpace => &self.virtual_spaces,
        }
    }

    pub fn resources_mut(&mut self, kind: Kind) -> &mut Vec<UserResource> {
        match kind {
            Kind::Tenant => &mut self.tenants,
            Kind::Project => &mut self.projects,
            Kind::Environment => &mut self.environments,
            Kind::VirtualSpace => &mut self.virtual_spaces,
        }
    }

    /// The caller's role on `(kind, id)`, if any.
    pub fn resource_role(&self, kind: Kind, id: u64) -> Option<&str> {
        self.resources(kind)
            .iter()
            .find(|resource| resource.id == id)
            .map(|resource| resource.role.as_str())
    }

    fn has_role(&self, kind: Kind, id: u64, role: &str) -> bool {
        self.resource_role(kind, id) == Some(role)
    }

    pub fn is_system_admin(&self) -> bool {
        self.system_role == ROLE_SYSTEM_ADMIN
    }

    pub fn is_any_tenant_admin(&self) -> bool {
        self.tenants
            .iter()
            .any(|tenant| tenant.role == ROLE_TENANT_ADMIN)
    }

    pub fn is_any_virtual_space_admin(&self) -> bool {
        self.virtual_spaces
            .iter()
            .any(|space| space.role == ROLE_VIRTUAL_SPACE_ADMIN)
    }

    pub fn is_tenant_admin(&self, id: u64) -> bool {
        self.has_role(Kind::Tenant, id, ROLE_TENANT_ADMIN)
    }

    pub fn is_tenant_member(&self, id: u64) -> bool {
        self.resource_role(Kind::Tenant, id).is_some()
    }

    pub fn is_project_admin(&self, id: u64) -> bool {
        self.has_role(Kind::Project, id, ROLE_PROJECT_ADMIN)
    }

    pub fn is_project_dev(&self, id: u64) -> bool {
        self.has_role(Kind::Project, id, ROLE_PROJECT_DEV)
    }

    pub fn is_project_test(&self, id: u64) -> bool {
        self.has_role(Kind::Project, id, ROLE_PROJECT_TEST)
    }

    pub fn is_project_ops(&self, id: u64) -> bool {
        self.has_role(Kind::Project, id, ROLE_PROJECT_OPS)
    }

    pub fn is_environment_operator(&self, id: u64) -> bool {
        self.has_role(Kind::Environment, id, ROLE_ENVIRONMENT_OPERATOR)
    }

    pub fn is_environment_reader(&self, id: u64) -> bool {
        self.has_role(Kind::Environment, id, ROLE_ENVIRONMENT_READER)
    }

    pub fn is_virtual_space_admin(&self, id: u64) -> bool {
        self.has_role(Kind::VirtualSpace, id, ROLE_VIRTUAL_SPACE_ADMIN)
    }

    pub fn is_virtual_space_member(&self, id: u64) -> bool {
        self.resource_role(Kind::VirtualSpace, id).is_some()
    }
}
