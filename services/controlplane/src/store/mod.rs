//! System-of-record access.
//!
//! # Purpose
//! The cache bootstrap and the authority resolver read topology and membership
//! rows through [`RecordStore`]. Full CRUD of these tables belongs to other
//! services; this layer is read-only apart from the in-memory store's seeding
//! helpers.
use crate::model::{
    EnvironmentRecord, Kind, Membership, ProjectRecord, TenantRecord, Topology, User,
    VirtualSpaceRecord,
};
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_tenants(&self) -> StoreResult<Vec<TenantRecord>>;
    async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>>;
    async fn list_environments(&self) -> StoreResult<Vec<EnvironmentRecord>>;
    async fn list_virtual_spaces(&self) -> StoreResult<Vec<VirtualSpaceRecord>>;

    async fn get_user(&self, username: &str) -> StoreResult<Option<User>>;
    /// The user's membership rows for one scope kind, joined with resource names.
    async fn user_memberships(&self, user_id: u64, kind: Kind) -> StoreResult<Vec<Membership>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;

    /// Every topology table in one call. Any failing query fails the whole load.
    async fn load_topology(&self) -> StoreResult<Topology> {
        Ok(Topology {
            tenants: self.list_tenants().await?,
            projects: self.list_projects().await?,
            environments: self.list_environments().await?,
            virtual_spaces: self.list_virtual_spaces().await?,
        })
    }
}
