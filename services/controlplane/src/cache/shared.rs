//! Shared implementation of the resource-tree cache.
//!
//! # What this module is
//! Every replica reads and writes the same `model_cache` table in the shared
//! Postgres database, so a topology change written through one instance is
//! visible to permission checks on all of them.
//!
//! # Key layout
//! - `{kind}_{id}`: entity JSON, no expiry.
//! - `user_authority_data__{username}`: authority JSON, expires after the TTL.
//! - `lock_{name}`: lease rows owned by [`DistributedLock`].
//!
//! The `{cluster}_{namespace}` index lives in `model_cache_environments` and
//! maps to an environment id. A namespace named like a primary key therefore
//! never touches an entity row.
//!
//! # Consistency
//! - Each mutation takes the `model_cache` lease, then applies the entity row
//!   and the owner's child list in one transaction. The lease serializes the
//!   read-modify-write of child lists across instances.
//! - `find_parents` is a single recursive query, so a chain is read from one
//!   snapshot and never interleaves with a concurrent write.
//! - Every statement runs under `operation_timeout`; lock waits are bounded by
//!   `lock_timeout`. Expiry surfaces as an error and callers fail closed.
//!
//! # Expiry
//! Expired authority and lease rows are filtered on read and deleted by a
//! best-effort background sweeper.
use super::authority::AuthorityResolver;
use super::lock::DistributedLock;
use super::{
    CacheConfig, CacheError, CacheResult, MAX_CHAIN_DEPTH, ModelCache, plan_upsert, record_write,
};
use crate::model::{
    Entity, Kind, ResourceRef, User, UserAuthority, cache_key, environment_key,
    user_authority_key,
};
use crate::store::RecordStore;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const TREE_LOCK: &str = "model_cache";

pub struct SharedModelCache {
    pool: PgPool,
    lock: DistributedLock,
    resolver: AuthorityResolver,
    config: CacheConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl SharedModelCache {
    /// Wrap an already-migrated pool. Starts the expiry sweeper.
    pub fn new(pool: PgPool, records: Arc<dyn RecordStore>, config: CacheConfig) -> Self {
        let sweeper = spawn_expiry_sweeper(pool.clone(), config.expiry_sweep_interval);
        Self::build(pool, records, config, Some(sweeper))
    }

    /// Same as [`SharedModelCache::new`] without the background sweeper.
    pub fn without_sweeper(
        pool: PgPool,
        records: Arc<dyn RecordStore>,
        config: CacheConfig,
    ) -> Self {
        Self::build(pool, records, config, None)
    }

    fn build(
        pool: PgPool,
        records: Arc<dyn RecordStore>,
        config: CacheConfig,
        sweeper: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            lock: DistributedLock::new(pool.clone(), TREE_LOCK, config.lock_timeout),
            resolver: AuthorityResolver::new(records),
            pool,
            config,
            sweeper,
        }
    }

    async fn bounded<T>(&self, operation: impl Future<Output = CacheResult<T>>) -> CacheResult<T> {
        let limit = self.config.operation_timeout;
        tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| CacheError::Timeout(limit))?
    }

    /// Run `operation` while holding the tree lease. The lease is released
    /// whether or not the operation succeeded.
    async fn locked<T>(&self, operation: impl Future<Output = CacheResult<T>>) -> CacheResult<T> {
        let lease = self.lock.lock().await?;
        let result = self.bounded(operation).await;
        if let Err(err) = self.lock.unlock(lease).await {
            tracing::error!(error = %err, "failed to release model cache lock");
        }
        result
    }

    async fn is_populated(&self) -> CacheResult<bool> {
        let populated = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM model_cache WHERE expires_at IS NULL AND jsonb_exists(value, 'kind'))",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(populated)
    }

    async fn populate(&self, entities: Vec<Entity>) -> CacheResult<bool> {
        // Re-check under the lease; a concurrent instance may have won.
        if self.is_populated().await? {
            return Ok(false);
        }
        let mut keys = Vec::with_capacity(entities.len());
        let mut values = Vec::with_capacity(entities.len());
        let mut env_keys = Vec::new();
        let mut env_ids = Vec::new();
        for entity in &entities {
            if let Some(env_key) = entity.environment_key() {
                env_keys.push(env_key);
                env_ids.push(entity.id as i64);
            }
            keys.push(entity.cache_key());
            values.push(serde_json::to_value(entity)?);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO model_cache (key, value, expires_at)
               SELECT key, value, NULL FROM UNNEST($1::text[], $2::jsonb[]) AS t(key, value)
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = NULL"#,
        )
        .bind(&keys)
        .bind(&values)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"INSERT INTO model_cache_environments (key, environment_id)
               SELECT key, id FROM UNNEST($1::text[], $2::bigint[]) AS t(key, id)
               ON CONFLICT (key) DO UPDATE SET environment_id = EXCLUDED.environment_id"#,
        )
        .bind(&env_keys)
        .bind(&env_ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        metrics::gauge!("model_cache_entities", "backend" => "shared").set(entities.len() as f64);
        tracing::info!(entities = entities.len(), "shared model cache populated");
        Ok(true)
    }

    async fn apply_upsert(&self, entity: Entity) -> CacheResult<bool> {
        let kind = entity.kind;
        let mut tx = self.pool.begin().await?;
        let existing = load_entity(&mut tx, &entity.cache_key()).await?;
        let plan = plan_upsert(existing.as_ref(), entity);
        let child = plan.entity.resource_ref();
        let mut changed = plan.write_entity;

        if let Some(stale) = &plan.stale_environment_key {
            unbind_environment(&mut tx, stale, child.id).await?;
        }
        for owner in &plan.detach {
            changed |= update_owner(&mut tx, *owner, child, |parent| parent.remove_child(&child))
                .await?;
        }
        if plan.write_entity {
            let value = serde_json::to_value(&plan.entity)?;
            if !store_value(&mut tx, &plan.entity.cache_key(), &value).await? {
                tracing::warn!(key = %plan.entity.cache_key(), "cache row held by another kind; upsert refused");
                return Err(CacheError::KeyConflict(plan.entity.cache_key()));
            }
            if let Some(env_key) = plan.entity.environment_key() {
                bind_environment(&mut tx, &env_key, child.id).await?;
            }
        }
        for owner in &plan.attach {
            changed |= update_owner(&mut tx, *owner, child, |parent| parent.add_child(child))
                .await?;
        }
        tx.commit().await?;

        if changed {
            record_write(kind, "upsert");
        }
        Ok(changed)
    }

    async fn apply_delete(&self, target: ResourceRef) -> CacheResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(removed) = load_entity(&mut tx, &target.cache_key()).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM model_cache WHERE key = $1")
            .bind(target.cache_key())
            .execute(&mut *tx)
            .await?;
        if let Some(env_key) = removed.environment_key() {
            unbind_environment(&mut tx, &env_key, target.id).await?;
        }
        for owner in &removed.owner {
            update_owner(&mut tx, *owner, target, |parent| parent.remove_child(&target)).await?;
        }
        tx.commit().await?;
        record_write(target.kind, "delete");
        Ok(true)
    }

    async fn load_authority(&self, username: &str) -> CacheResult<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            "SELECT value FROM model_cache WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(user_authority_key(username))
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn store_authority(&self, username: &str, authority: &UserAuthority) -> CacheResult<()> {
        sqlx::query(
            r#"INSERT INTO model_cache (key, value, expires_at)
               VALUES ($1, $2, now() + make_interval(secs => $3))
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at"#,
        )
        .bind(user_authority_key(username))
        .bind(serde_json::to_value(authority)?)
        .bind(self.config.authority_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> CacheResult<()> {
        sqlx::query("DELETE FROM model_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_entity(&self, key: &str) -> CacheResult<Option<Entity>> {
        let mut conn = self.pool.acquire().await?;
        load_entity(&mut conn, key).await
    }
}

impl Drop for SharedModelCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn load_entity(conn: &mut PgConnection, key: &str) -> CacheResult<Option<Entity>> {
    let value = sqlx::query_scalar::<_, Value>(
        "SELECT value FROM model_cache WHERE key = $1 AND expires_at IS NULL",
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(value.map(serde_json::from_value).transpose()?)
}

/// Returns `true` when the row changed. An existing row of another kind, or
/// an expiring row such as a lease, is never overwritten.
async fn store_value(conn: &mut PgConnection, key: &str, value: &Value) -> CacheResult<bool> {
    let result = sqlx::query(
        r#"INSERT INTO model_cache (key, value, expires_at) VALUES ($1, $2, NULL)
           ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = NULL
           WHERE model_cache.expires_at IS NULL
             AND model_cache.value ->> 'kind' = EXCLUDED.value ->> 'kind'
             AND model_cache.value IS DISTINCT FROM EXCLUDED.value"#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn bind_environment(conn: &mut PgConnection, env_key: &str, id: u64) -> CacheResult<()> {
    sqlx::query(
        r#"INSERT INTO model_cache_environments (key, environment_id) VALUES ($1, $2)
           ON CONFLICT (key) DO UPDATE SET environment_id = EXCLUDED.environment_id"#,
    )
    .bind(env_key)
    .bind(id as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drop an index row only while it still points at environment `id`.
async fn unbind_environment(conn: &mut PgConnection, env_key: &str, id: u64) -> CacheResult<()> {
    sqlx::query("DELETE FROM model_cache_environments WHERE key = $1 AND environment_id = $2")
        .bind(env_key)
        .bind(id as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn update_owner(
    conn: &mut PgConnection,
    owner: ResourceRef,
    child: ResourceRef,
    update: impl FnOnce(&mut Entity) -> bool,
) -> CacheResult<bool> {
    let Some(mut parent) = load_entity(conn, &owner.cache_key()).await? else {
        tracing::warn!(%owner, %child, "owner not cached; child link skipped");
        return Ok(false);
    };
    if !update(&mut parent) {
        return Ok(false);
    }
    store_value(conn, &owner.cache_key(), &serde_json::to_value(&parent)?).await
}

/// Periodically delete expired authority and lease rows. Best-effort: failures
/// are logged and retried on the next tick.
fn spawn_expiry_sweeper(pool: PgPool, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match sqlx::query(
                "DELETE FROM model_cache WHERE expires_at IS NOT NULL AND expires_at <= now()",
            )
            .execute(&pool)
            .await
            {
                Ok(result) if result.rows_affected() > 0 => {
                    tracing::debug!(rows = result.rows_affected(), "expired cache rows swept");
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(error = %err, "expiry sweep failed"),
            }
        }
    })
}

#[async_trait]
impl ModelCache for SharedModelCache {
    async fn build_if_not_exist(&self) -> CacheResult<bool> {
        if self.bounded(self.is_populated()).await? {
            return Ok(false);
        }
        let topology = self.resolver.records().load_topology().await?;
        self.locked(self.populate(topology.entities())).await
    }

    async fn upsert(&self, entity: Entity) -> CacheResult<bool> {
        self.locked(self.apply_upsert(entity)).await
    }

    async fn delete(&self, target: ResourceRef) -> CacheResult<bool> {
        self.locked(self.apply_delete(target)).await
    }

    async fn find_parents(&self, kind: Kind, id: u64) -> CacheResult<Vec<Entity>> {
        let rows = self
            .bounded(async {
                Ok::<_, CacheError>(sqlx::query_scalar::<_, Value>(
                    r#"WITH RECURSIVE chain (key, value, depth) AS (
                           SELECT key, value, 0 FROM model_cache
                           WHERE key = $1 AND expires_at IS NULL
                           UNION ALL
                           SELECT m.key, m.value, c.depth + 1
                           FROM chain c
                           JOIN model_cache m
                             ON m.key = (c.value #>> '{owner,0,kind}') || '_' || (c.value #>> '{owner,0,id}')
                            AND m.expires_at IS NULL
                            AND m.value ->> 'kind' = c.value #>> '{owner,0,kind}'
                            AND m.value ->> 'id' = c.value #>> '{owner,0,id}'
                           WHERE c.depth < $2
                       )
                       SELECT value FROM chain ORDER BY depth DESC"#,
                )
                .bind(cache_key(kind, id))
                .bind((MAX_CHAIN_DEPTH - 1) as i32)
                .fetch_all(&self.pool)
                .await?)
            })
            .await?;
        let chain = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Entity>, _>>()?;
        if let Some(root) = chain.first()
            && let Some(owner) = root.owner.first()
        {
            tracing::warn!(
                %owner,
                child = %root.resource_ref(),
                "ancestor missing from model cache"
            );
        }
        Ok(chain)
    }

    async fn find_resource(&self, kind: Kind, id: u64) -> CacheResult<Option<Entity>> {
        self.bounded(self.fetch_entity(&cache_key(kind, id))).await
    }

    async fn find_environment(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> CacheResult<Option<Entity>> {
        let key = environment_key(cluster, namespace);
        let value = self
            .bounded(async {
                Ok::<_, CacheError>(sqlx::query_scalar::<_, Value>(
                    r#"SELECT m.value FROM model_cache_environments e
                       JOIN model_cache m
                         ON m.key = 'environment_' || e.environment_id
                        AND m.expires_at IS NULL
                       WHERE e.key = $1"#,
                )
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?)
            })
            .await?;
        let entity = value.map(serde_json::from_value::<Entity>).transpose()?;
        Ok(entity.filter(|entity| entity.kind == Kind::Environment))
    }

    async fn find_children(&self, kind: Kind, id: u64) -> CacheResult<Vec<Entity>> {
        let Some(parent) = self.find_resource(kind, id).await? else {
            return Ok(Vec::new());
        };
        if parent.children.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = parent.children.iter().map(ResourceRef::cache_key).collect();
        let rows = self
            .bounded(async {
                Ok::<_, CacheError>(sqlx::query_scalar::<_, Value>(
                    "SELECT value FROM model_cache WHERE key = ANY($1) AND expires_at IS NULL",
                )
                .bind(&keys)
                .fetch_all(&self.pool)
                .await?)
            })
            .await?;
        let mut children = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Entity>, _>>()?;
        children.sort_by_key(|child| {
            parent
                .children
                .iter()
                .position(|candidate| *candidate == child.resource_ref())
        });
        Ok(children)
    }

    async fn get_user_authority(&self, user: &User) -> CacheResult<UserAuthority> {
        if let Some(value) = self.bounded(self.load_authority(&user.username)).await? {
            match serde_json::from_value::<UserAuthority>(value) {
                Ok(authority) => return Ok(authority),
                Err(err) => {
                    tracing::warn!(username = %user.username, error = %err, "unreadable cached authority; rebuilding");
                }
            }
        }
        self.flush_user_authority(user).await
    }

    async fn flush_user_authority(&self, user: &User) -> CacheResult<UserAuthority> {
        let resolved = self.resolver.resolve(user, self.backend_name()).await;
        let key = user_authority_key(&user.username);
        if resolved.degraded {
            self.bounded(self.delete_key(&key)).await?;
        } else {
            self.bounded(self.store_authority(&user.username, &resolved.authority))
                .await?;
        }
        Ok(resolved.authority)
    }

    async fn invalidate_user_authority(&self, username: &str) -> CacheResult<()> {
        self.bounded(self.delete_key(&user_authority_key(username)))
            .await
    }

    fn backend_name(&self) -> &'static str {
        "shared"
    }
}
