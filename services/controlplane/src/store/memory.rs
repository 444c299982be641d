//! In-memory implementation of the system of record.
//!
//! # Purpose
//! Implements [`RecordStore`] with `HashMap`s behind `tokio::sync::RwLock`. It
//! backs local development, the HTTP smoke tests, and the cache conformance
//! suite, and exposes seeding helpers that the Postgres store does not.
//!
//! # Durability and consistency
//! - **Not durable**: all rows are lost on restart.
//! - Membership reads join against the current resource maps, so a membership
//!   whose resource was removed is dropped from the result.
//!
//! # Failure injection
//! [`InMemoryRecordStore::set_available`] makes every read fail with
//! [`StoreError::Unavailable`], which tests use to exercise degraded paths.
use super::{RecordStore, StoreError, StoreResult};
use crate::model::{
    EnvironmentRecord, Kind, Membership, ProjectRecord, TenantRecord, User, VirtualSpaceRecord,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Membership rows keyed by `(user_id, kind)`, then resource id → role.
type Memberships = HashMap<(u64, Kind), BTreeMap<u64, String>>;

#[derive(Default)]
pub struct InMemoryRecordStore {
    tenants: Arc<RwLock<BTreeMap<u64, TenantRecord>>>,
    projects: Arc<RwLock<BTreeMap<u64, ProjectRecord>>>,
    environments: Arc<RwLock<BTreeMap<u64, EnvironmentRecord>>>,
    virtual_spaces: Arc<RwLock<BTreeMap<u64, VirtualSpaceRecord>>>,
    users: Arc<RwLock<HashMap<String, User>>>,
    memberships: Arc<RwLock<Memberships>>,
    unavailable: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store disabled".into()));
        }
        Ok(())
    }

    pub async fn insert_tenant(&self, id: u64, name: impl Into<String>) -> TenantRecord {
        let record = TenantRecord {
            id,
            name: name.into(),
        };
        self.tenants.write().await.insert(id, record.clone());
        record
    }

    pub async fn insert_project(
        &self,
        tenant_id: u64,
        id: u64,
        name: impl Into<String>,
    ) -> ProjectRecord {
        let record = ProjectRecord {
            id,
            tenant_id,
            name: name.into(),
        };
        self.projects.write().await.insert(id, record.clone());
        record
    }

    pub async fn insert_environment(
        &self,
        project_id: u64,
        id: u64,
        name: impl Into<String>,
        cluster: Option<&str>,
        namespace: impl Into<String>,
    ) -> EnvironmentRecord {
        let record = EnvironmentRecord {
            id,
            project_id,
            name: name.into(),
            cluster: cluster.map(str::to_string),
            namespace: namespace.into(),
        };
        self.environments.write().await.insert(id, record.clone());
        record
    }

    pub async fn insert_virtual_space(
        &self,
        id: u64,
        name: impl Into<String>,
    ) -> VirtualSpaceRecord {
        let record = VirtualSpaceRecord {
            id,
            name: name.into(),
        };
        self.virtual_spaces.write().await.insert(id, record.clone());
        record
    }

    pub async fn insert_user(
        &self,
        id: u64,
        username: impl Into<String>,
        system_role: impl Into<String>,
    ) -> User {
        let user = User {
            id,
            username: username.into(),
            system_role: system_role.into(),
        };
        self.users
            .write()
            .await
            .insert(user.username.clone(), user.clone());
        user
    }

    pub async fn add_membership(
        &self,
        user_id: u64,
        kind: Kind,
        resource_id: u64,
        role: impl Into<String>,
    ) {
        self.memberships
            .write()
            .await
            .entry((user_id, kind))
            .or_default()
            .insert(resource_id, role.into());
    }

    pub async fn remove_membership(&self, user_id: u64, kind: Kind, resource_id: u64) -> bool {
        self.memberships
            .write()
            .await
            .get_mut(&(user_id, kind))
            .map(|rows| rows.remove(&resource_id).is_some())
            .unwrap_or(false)
    }

    /// Name of `(kind, id)` if the resource still exists.
    async fn resource_name(&self, kind: Kind, id: u64) -> Option<String> {
        match kind {
            Kind::Tenant => self.tenants.read().await.get(&id).map(|r| r.name.clone()),
            Kind::Project => self.projects.read().await.get(&id).map(|r| r.name.clone()),
            Kind::Environment => self
                .environments
                .read()
                .await
                .get(&id)
                .map(|r| r.name.clone()),
            Kind::VirtualSpace => self
                .virtual_spaces
                .read()
                .await
                .get(&id)
                .map(|r| r.name.clone()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_tenants(&self) -> StoreResult<Vec<TenantRecord>> {
        self.ensure_available()?;
        Ok(self.tenants.read().await.values().cloned().collect())
    }

    async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>> {
        self.ensure_available()?;
        Ok(self.projects.read().await.values().cloned().collect())
    }

    async fn list_environments(&self) -> StoreResult<Vec<EnvironmentRecord>> {
        self.ensure_available()?;
        Ok(self.environments.read().await.values().cloned().collect())
    }

    async fn list_virtual_spaces(&self) -> StoreResult<Vec<VirtualSpaceRecord>> {
        self.ensure_available()?;
        Ok(self.virtual_spaces.read().await.values().cloned().collect())
    }

    async fn get_user(&self, username: &str) -> StoreResult<Option<User>> {
        self.ensure_available()?;
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn user_memberships(&self, user_id: u64, kind: Kind) -> StoreResult<Vec<Membership>> {
        self.ensure_available()?;
        let rows: Vec<(u64, String)> = self
            .memberships
            .read()
            .await
            .get(&(user_id, kind))
            .map(|rows| rows.iter().map(|(id, role)| (*id, role.clone())).collect())
            .unwrap_or_default();
        let mut memberships = Vec::with_capacity(rows.len());
        for (resource_id, role) in rows {
            if let Some(resource_name) = self.resource_name(kind, resource_id).await {
                memberships.push(Membership {
                    resource_id,
                    resource_name,
                    role,
                });
            }
        }
        Ok(memberships)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_available()
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memberships_join_resource_names() {
        let store = InMemoryRecordStore::new();
        store.insert_tenant(1, "t1").await;
        store.insert_user(7, "alice", "normal").await;
        store.add_membership(7, Kind::Tenant, 1, "admin").await;
        store.add_membership(7, Kind::Tenant, 2, "admin").await;

        let rows = store.user_memberships(7, Kind::Tenant).await.unwrap();
        assert_eq!(
            rows,
            vec![Membership {
                resource_id: 1,
                resource_name: "t1".into(),
                role: "admin".into(),
            }]
        );
        assert!(
            store
                .user_memberships(7, Kind::Project)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn remove_membership_reports_presence() {
        let store = InMemoryRecordStore::new();
        store.add_membership(7, Kind::Project, 5, "dev").await;
        assert!(store.remove_membership(7, Kind::Project, 5).await);
        assert!(!store.remove_membership(7, Kind::Project, 5).await);
    }

    #[tokio::test]
    async fn unavailable_store_fails_reads() {
        let store = InMemoryRecordStore::new();
        store.insert_tenant(1, "t1").await;
        store.set_available(false);
        assert!(matches!(
            store.list_tenants().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.health_check().await.is_err());
        store.set_available(true);
        assert_eq!(store.load_topology().await.unwrap().tenants.len(), 1);
    }

    #[tokio::test]
    async fn get_user_by_name() {
        let store = InMemoryRecordStore::new();
        store.insert_user(1, "root", "sysadmin").await;
        let user = store.get_user("root").await.unwrap().unwrap();
        assert_eq!(user.system_role, "sysadmin");
        assert!(store.get_user("nobody").await.unwrap().is_none());
        assert_eq!(store.backend_name(), "memory");
        assert!(!store.is_durable());
    }
}
