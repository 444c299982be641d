//! Control-plane data model module.
//!
//! # Purpose
//! Re-exports the cached topology entities, the per-user authority snapshot,
//! and the system-of-record rows used by the store and cache layers.
mod authority;
mod entity;
mod records;

pub use authority::{
    ROLE_ENVIRONMENT_OPERATOR, ROLE_ENVIRONMENT_READER, ROLE_PROJECT_ADMIN, ROLE_PROJECT_DEV,
    ROLE_PROJECT_OPS, ROLE_PROJECT_TEST, ROLE_SYSTEM_ADMIN, ROLE_SYSTEM_NORMAL, ROLE_TENANT_ADMIN,
    ROLE_TENANT_ORDINARY, ROLE_VIRTUAL_SPACE_ADMIN, ROLE_VIRTUAL_SPACE_NORMAL, UserAuthority,
    UserResource, role_grants_mutation, role_is_admin,
};
pub use entity::{Entity, Kind, ResourceRef, UnknownKind, cache_key, environment_key};
pub use records::{
    EnvironmentRecord, Membership, ProjectRecord, TenantRecord, Topology, User,
    VirtualSpaceRecord, link_children,
};

/// Key of a cached user authority: `user_authority_data__{username}`.
pub fn user_authority_key(username: &str) -> String {
    format!("user_authority_data__{username}")
}
