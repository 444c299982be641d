//! Resource-tree cache.
//!
//! # Purpose
//! [`ModelCache`] answers "what contains this resource" and "what roles does
//! this user hold" for the permission checker. Two implementations share one
//! contract and one conformance suite:
//! - [`memory::InMemoryModelCache`]: process-local, for single-instance and
//!   test deployments.
//! - [`shared::SharedModelCache`]: rows in the shared Postgres database,
//!   consistent across replicas, writes serialized by [`lock::DistributedLock`].
//!
//! # Key invariants
//! - `find_parents` is root-first, self-inclusive, and empty for an unknown
//!   resource. A missing ancestor mid-walk is a consistency warning, not an
//!   error; the chain simply lacks it.
//! - Upserting the same entity twice reports no change the second time and
//!   never duplicates a child reference on its owner.
//! - Deleting an entity leaves its descendants in place.
//! - Authority snapshots built from a failing record store are returned but
//!   never cached.
use crate::model::{Entity, Kind, ResourceRef, User, UserAuthority};
use crate::store::StoreError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod authority;
pub mod lock;
pub mod memory;
pub mod shared;

/// Owner walks stop after this many hops; real chains are at most three deep.
pub const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub authority_ttl: Duration,
    pub authority_capacity: usize,
    pub lock_timeout: Duration,
    pub operation_timeout: Duration,
    pub expiry_sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            authority_ttl: Duration::from_secs(180 * 60),
            authority_capacity: 128,
            lock_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            expiry_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::ControlPlaneConfig> for CacheConfig {
    fn from(config: &crate::config::ControlPlaneConfig) -> Self {
        Self {
            authority_ttl: config.authority_ttl(),
            authority_capacity: config.authority_capacity,
            lock_timeout: config.lock_timeout(),
            operation_timeout: config.operation_timeout(),
            expiry_sweep_interval: config.expiry_sweep_interval(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("record store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("cache entry codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("timed out acquiring lock {name} after {waited:?}")]
    LockTimeout { name: String, waited: Duration },
    #[error("cache key {0} is held by a different record")]
    KeyConflict(String),
}

impl CacheError {
    /// Contention and transient infrastructure failures; callers may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Timeout(_) | CacheError::LockTimeout { .. } | CacheError::Database(_)
        )
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait ModelCache: Send + Sync {
    /// Populate from the system of record when no entity is cached yet.
    /// Returns `true` when this call performed the population.
    async fn build_if_not_exist(&self) -> CacheResult<bool>;

    /// Insert or replace one entity and link it under its owners. Returns
    /// `true` when anything stored changed.
    async fn upsert(&self, entity: Entity) -> CacheResult<bool>;

    /// Remove one entity and unlink it from its owners. Returns `true` when it
    /// was cached.
    async fn delete(&self, target: ResourceRef) -> CacheResult<bool>;

    async fn find_parents(&self, kind: Kind, id: u64) -> CacheResult<Vec<Entity>>;
    async fn find_resource(&self, kind: Kind, id: u64) -> CacheResult<Option<Entity>>;
    async fn find_environment(&self, cluster: &str, namespace: &str)
    -> CacheResult<Option<Entity>>;
    /// Direct children that are still cached.
    async fn find_children(&self, kind: Kind, id: u64) -> CacheResult<Vec<Entity>>;

    /// Cached snapshot, rebuilt synchronously on miss or unreadable entry.
    async fn get_user_authority(&self, user: &User) -> CacheResult<UserAuthority>;
    /// Rebuild and store the snapshot regardless of what is cached.
    async fn flush_user_authority(&self, user: &User) -> CacheResult<UserAuthority>;
    async fn invalidate_user_authority(&self, username: &str) -> CacheResult<()>;

    fn backend_name(&self) -> &'static str;

    async fn upsert_tenant(&self, id: u64, name: &str) -> CacheResult<bool> {
        self.upsert(Entity::tenant(id, name)).await
    }

    async fn upsert_project(&self, tenant_id: u64, id: u64, name: &str) -> CacheResult<bool> {
        self.upsert(Entity::project(tenant_id, id, name)).await
    }

    async fn upsert_environment(
        &self,
        project_id: u64,
        id: u64,
        name: &str,
        cluster: &str,
        namespace: &str,
    ) -> CacheResult<bool> {
        self.upsert(Entity::environment(project_id, id, name, cluster, namespace))
            .await
    }

    async fn upsert_virtual_space(&self, id: u64, name: &str) -> CacheResult<bool> {
        self.upsert(Entity::virtual_space(id, name)).await
    }

    async fn delete_tenant(&self, id: u64) -> CacheResult<bool> {
        self.delete(ResourceRef::new(Kind::Tenant, id)).await
    }

    async fn delete_project(&self, id: u64) -> CacheResult<bool> {
        self.delete(ResourceRef::new(Kind::Project, id)).await
    }

    async fn delete_environment(&self, id: u64) -> CacheResult<bool> {
        self.delete(ResourceRef::new(Kind::Environment, id)).await
    }

    async fn delete_virtual_space(&self, id: u64) -> CacheResult<bool> {
        self.delete(ResourceRef::new(Kind::VirtualSpace, id)).await
    }
}

/// Writes needed to apply one upsert, computed from the stored version.
#[derive(Debug)]
pub(crate) struct UpsertPlan {
    pub entity: Entity,
    /// The entity row itself differs from what is stored.
    pub write_entity: bool,
    /// Secondary key to drop because the environment moved.
    pub stale_environment_key: Option<String>,
    /// Owners that must list the entity as a child.
    pub attach: Vec<ResourceRef>,
    /// Former owners that must stop listing it.
    pub detach: Vec<ResourceRef>,
}

pub(crate) fn plan_upsert(existing: Option<&Entity>, mut incoming: Entity) -> UpsertPlan {
    let mut detach = Vec::new();
    let mut stale_environment_key = None;
    let write_entity = match existing {
        Some(existing) => {
            incoming.children = existing.children.clone();
            detach = existing
                .owner
                .iter()
                .filter(|owner| !incoming.owner.contains(owner))
                .copied()
                .collect();
            let previous_key = existing.environment_key();
            if previous_key.is_some() && previous_key != incoming.environment_key() {
                stale_environment_key = previous_key;
            }
            !existing.same_shape(&incoming)
        }
        None => true,
    };
    UpsertPlan {
        attach: incoming.owner.clone(),
        entity: incoming,
        write_entity,
        stale_environment_key,
        detach,
    }
}

pub(crate) fn record_write(kind: Kind, op: &'static str) {
    metrics::counter!("model_cache_writes_total", "kind" => kind.as_str(), "op" => op)
        .increment(1);
}
