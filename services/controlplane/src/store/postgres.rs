//! Postgres-backed system of record.
//!
//! # What this module is
//! Implements [`RecordStore`] over the relational tables created by
//! `migrations/0001_records.sql`: topology tables, users with their system
//! role, and one membership table per scope kind.
//!
//! # Key invariants
//! - Reads only. Topology and membership CRUD belongs to other services, which
//!   call the cache write-through hooks after committing.
//! - Membership queries come from a fixed per-kind allowlist; no caller input
//!   reaches the SQL text.
//!
//! # Operational notes
//! - Migrations run at connect time via `sqlx::migrate!("./migrations")`, which
//!   also creates the shared cache table used by `cache::shared`.
//! - Pool sizing and timeouts come from [`PostgresConfig`]; hanging forever on
//!   a dead database is worse than failing the request.
//! - Database URLs may contain credentials; never log `pg.url`.
use super::{RecordStore, StoreResult};
use crate::config::PostgresConfig;
use crate::model::{
    EnvironmentRecord, Kind, Membership, ProjectRecord, TenantRecord, User, VirtualSpaceRecord,
    ROLE_SYSTEM_NORMAL,
};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;

/// Open a pool and, when asked, apply the embedded migrations.
///
/// Shared by [`PostgresRecordStore`] and the shared cache backend so both can
/// run against one database with one schema.
pub async fn connect_pool(pg: &PostgresConfig, run_migrations: bool) -> StoreResult<PgPool> {
    let connect_options = PgConnectOptions::from_str(&pg.url)?;
    let pool = PgPoolOptions::new()
        .max_connections(pg.max_connections)
        .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
        .connect_with(connect_options);
    let pool = tokio::time::timeout(Duration::from_millis(pg.connect_timeout_ms), pool)
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)??;

    if run_migrations {
        // Fail startup rather than serve against a partial schema.
        sqlx::migrate!("./migrations").run(&pool).await?;
    }
    Ok(pool)
}

pub struct PostgresRecordStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct DbTenant {
    id: i64,
    name: String,
}

#[derive(Debug, FromRow)]
struct DbProject {
    id: i64,
    tenant_id: i64,
    name: String,
}

#[derive(Debug, FromRow)]
struct DbEnvironment {
    id: i64,
    project_id: i64,
    name: String,
    cluster: Option<String>,
    namespace: String,
}

#[derive(Debug, FromRow)]
struct DbUser {
    id: i64,
    username: String,
    system_role: Option<String>,
}

#[derive(Debug, FromRow)]
struct DbMembership {
    resource_id: i64,
    resource_name: String,
    role: String,
}

impl PostgresRecordStore {
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        Ok(Self::from_pool(connect_pool(pg, true).await?))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn membership_query(kind: Kind) -> &'static str {
    match kind {
        Kind::Tenant => {
            "SELECT t.id AS resource_id, t.tenant_name AS resource_name, r.role \
             FROM tenant_user_rels r JOIN tenants t ON t.id = r.tenant_id \
             WHERE r.user_id = $1 ORDER BY t.id"
        }
        Kind::Project => {
            "SELECT p.id AS resource_id, p.project_name AS resource_name, r.role \
             FROM project_user_rels r JOIN projects p ON p.id = r.project_id \
             WHERE r.user_id = $1 ORDER BY p.id"
        }
        Kind::Environment => {
            "SELECT e.id AS resource_id, e.environment_name AS resource_name, r.role \
             FROM environment_user_rels r JOIN environments e ON e.id = r.environment_id \
             WHERE r.user_id = $1 ORDER BY e.id"
        }
        Kind::VirtualSpace => {
            "SELECT v.id AS resource_id, v.virtual_space_name AS resource_name, r.role \
             FROM virtual_space_user_rels r JOIN virtual_spaces v ON v.id = r.virtual_space_id \
             WHERE r.user_id = $1 ORDER BY v.id"
        }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn list_tenants(&self) -> StoreResult<Vec<TenantRecord>> {
        let rows = sqlx::query_as::<_, DbTenant>(
            "SELECT id, tenant_name AS name FROM tenants ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TenantRecord {
                id: row.id as u64,
                name: row.name,
            })
            .collect())
    }

    async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>> {
        let rows = sqlx::query_as::<_, DbProject>(
            "SELECT id, tenant_id, project_name AS name FROM projects ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ProjectRecord {
                id: row.id as u64,
                tenant_id: row.tenant_id as u64,
                name: row.name,
            })
            .collect())
    }

    async fn list_environments(&self) -> StoreResult<Vec<EnvironmentRecord>> {
        let rows = sqlx::query_as::<_, DbEnvironment>(
            r#"SELECT e.id, e.project_id, e.environment_name AS name, c.cluster_name AS cluster, e.namespace
               FROM environments e LEFT JOIN clusters c ON c.id = e.cluster_id
               ORDER BY e.id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| EnvironmentRecord {
                id: row.id as u64,
                project_id: row.project_id as u64,
                name: row.name,
                cluster: row.cluster,
                namespace: row.namespace,
            })
            .collect())
    }

    async fn list_virtual_spaces(&self) -> StoreResult<Vec<VirtualSpaceRecord>> {
        let rows = sqlx::query_as::<_, DbTenant>(
            "SELECT id, virtual_space_name AS name FROM virtual_spaces ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| VirtualSpaceRecord {
                id: row.id as u64,
                name: row.name,
            })
            .collect())
    }

    async fn get_user(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, DbUser>(
            r#"SELECT u.id, u.username, r.role_code AS system_role
               FROM users u LEFT JOIN system_roles r ON r.id = u.system_role_id
               WHERE u.username = $1"#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| User {
            id: row.id as u64,
            username: row.username,
            system_role: row
                .system_role
                .unwrap_or_else(|| ROLE_SYSTEM_NORMAL.to_string()),
        }))
    }

    async fn user_memberships(&self, user_id: u64, kind: Kind) -> StoreResult<Vec<Membership>> {
        let rows = sqlx::query_as::<_, DbMembership>(membership_query(kind))
            .bind(user_id as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Membership {
                resource_id: row.resource_id as u64,
                resource_name: row.resource_name,
                role: row.role,
            })
            .collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
