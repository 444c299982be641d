//! In-process implementation of the resource-tree cache.
//!
//! # Purpose
//! Holds every entity in one map behind a single read/write lock, with a
//! secondary `{cluster}_{namespace}` index for environments. Authority
//! snapshots live in a bounded LRU whose entries also expire after the
//! configured TTL.
//!
//! # Consistency
//! - **Not shared**: every instance has its own tree; use the shared backend
//!   when more than one replica serves checks.
//! - All structural mutations happen under the write lock, so one upsert and
//!   its owner linking are atomic with respect to readers.
use super::authority::AuthorityResolver;
use super::{
    CacheConfig, CacheResult, MAX_CHAIN_DEPTH, ModelCache, plan_upsert, record_write,
};
use crate::model::{Entity, Kind, ResourceRef, User, UserAuthority, cache_key, environment_key};
use crate::store::RecordStore;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// LRU map whose entries are dropped on read once older than `ttl`.
pub struct ExpiringLru<V> {
    entries: Mutex<LruCache<String, (V, Instant)>>,
    ttl: Duration,
}

impl<V: Clone> ExpiringLru<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((_, inserted)) => inserted.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|(value, _)| value.clone())
    }

    pub fn insert(&self, key: String, value: V) {
        self.entries.lock().put(key, (value, Instant::now()));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct Tree {
    entities: HashMap<String, Entity>,
    /// `{cluster}_{namespace}` → primary key.
    environments: HashMap<String, String>,
}

impl Tree {
    fn insert(&mut self, entity: Entity) {
        if let Some(env_key) = entity.environment_key() {
            self.environments.insert(env_key, entity.cache_key());
        }
        self.entities.insert(entity.cache_key(), entity);
    }

    /// Drop an index entry only while it still points at `primary`; the
    /// namespace may have been rebound to another environment since.
    fn drop_environment_key(&mut self, env_key: &str, primary: &str) {
        if self.environments.get(env_key).map(String::as_str) == Some(primary) {
            self.environments.remove(env_key);
        }
    }

    /// Apply `update` to the owner's child list; a missing owner is logged.
    fn link(
        &mut self,
        owner: ResourceRef,
        child: ResourceRef,
        update: impl FnOnce(&mut Entity) -> bool,
    ) -> bool {
        match self.entities.get_mut(&owner.cache_key()) {
            Some(parent) => update(parent),
            None => {
                tracing::warn!(%owner, %child, "owner not cached; child link skipped");
                false
            }
        }
    }
}

pub struct InMemoryModelCache {
    tree: RwLock<Tree>,
    authorities: ExpiringLru<UserAuthority>,
    resolver: AuthorityResolver,
}

impl InMemoryModelCache {
    pub fn new(records: Arc<dyn RecordStore>, config: &CacheConfig) -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            authorities: ExpiringLru::new(config.authority_capacity, config.authority_ttl),
            resolver: AuthorityResolver::new(records),
        }
    }

    fn update_entity_gauge(&self, count: usize) {
        metrics::gauge!("model_cache_entities", "backend" => "memory").set(count as f64);
    }
}

#[async_trait]
impl ModelCache for InMemoryModelCache {
    async fn build_if_not_exist(&self) -> CacheResult<bool> {
        if !self.tree.read().entities.is_empty() {
            return Ok(false);
        }
        let topology = self.resolver.records().load_topology().await?;
        let entities = topology.entities();
        let mut tree = self.tree.write();
        // Another task may have populated while the topology was loading.
        if !tree.entities.is_empty() {
            return Ok(false);
        }
        for entity in entities {
            tree.insert(entity);
        }
        let count = tree.entities.len();
        drop(tree);
        self.update_entity_gauge(count);
        tracing::info!(entities = count, "model cache populated");
        Ok(true)
    }

    async fn upsert(&self, entity: Entity) -> CacheResult<bool> {
        let kind = entity.kind;
        let mut tree = self.tree.write();
        let plan = plan_upsert(tree.entities.get(&entity.cache_key()), entity);
        let child = plan.entity.resource_ref();
        let mut changed = plan.write_entity;

        if let Some(stale) = &plan.stale_environment_key {
            tree.drop_environment_key(stale, &plan.entity.cache_key());
        }
        for owner in &plan.detach {
            changed |= tree.link(*owner, child, |parent| parent.remove_child(&child));
        }
        if plan.write_entity {
            tree.insert(plan.entity);
        }
        for owner in &plan.attach {
            changed |= tree.link(*owner, child, |parent| parent.add_child(child));
        }
        let count = tree.entities.len();
        drop(tree);

        if changed {
            record_write(kind, "upsert");
            self.update_entity_gauge(count);
        }
        Ok(changed)
    }

    async fn delete(&self, target: ResourceRef) -> CacheResult<bool> {
        let mut tree = self.tree.write();
        let Some(removed) = tree.entities.remove(&target.cache_key()) else {
            return Ok(false);
        };
        if let Some(env_key) = removed.environment_key() {
            tree.drop_environment_key(&env_key, &target.cache_key());
        }
        for owner in &removed.owner {
            tree.link(*owner, target, |parent| parent.remove_child(&target));
        }
        let count = tree.entities.len();
        drop(tree);

        record_write(target.kind, "delete");
        self.update_entity_gauge(count);
        Ok(true)
    }

    async fn find_parents(&self, kind: Kind, id: u64) -> CacheResult<Vec<Entity>> {
        let tree = self.tree.read();
        let mut chain = Vec::new();
        let Some(mut current) = tree.entities.get(&cache_key(kind, id)) else {
            return Ok(chain);
        };
        loop {
            chain.push(current.clone());
            if chain.len() >= MAX_CHAIN_DEPTH {
                tracing::warn!(%kind, id, "ownership chain exceeds maximum depth");
                break;
            }
            let Some(owner) = current.owner.first() else {
                break;
            };
            match tree.entities.get(&owner.cache_key()) {
                Some(parent) => current = parent,
                None => {
                    tracing::warn!(
                        %owner,
                        child = %current.resource_ref(),
                        "ancestor missing from model cache"
                    );
                    break;
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }

    async fn find_resource(&self, kind: Kind, id: u64) -> CacheResult<Option<Entity>> {
        Ok(self.tree.read().entities.get(&cache_key(kind, id)).cloned())
    }

    async fn find_environment(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> CacheResult<Option<Entity>> {
        let tree = self.tree.read();
        Ok(tree
            .environments
            .get(&environment_key(cluster, namespace))
            .and_then(|key| tree.entities.get(key))
            .cloned())
    }

    async fn find_children(&self, kind: Kind, id: u64) -> CacheResult<Vec<Entity>> {
        let tree = self.tree.read();
        let Some(parent) = tree.entities.get(&cache_key(kind, id)) else {
            return Ok(Vec::new());
        };
        Ok(parent
            .children
            .iter()
            .filter_map(|child| tree.entities.get(&child.cache_key()).cloned())
            .collect())
    }

    async fn get_user_authority(&self, user: &User) -> CacheResult<UserAuthority> {
        if let Some(authority) = self.authorities.get(&user.username) {
            return Ok(authority);
        }
        self.flush_user_authority(user).await
    }

    async fn flush_user_authority(&self, user: &User) -> CacheResult<UserAuthority> {
        let resolved = self.resolver.resolve(user, self.backend_name()).await;
        if resolved.degraded {
            self.authorities.remove(&user.username);
        } else {
            self.authorities
                .insert(user.username.clone(), resolved.authority.clone());
        }
        Ok(resolved.authority)
    }

    async fn invalidate_user_authority(&self, username: &str) -> CacheResult<()> {
        self.authorities.remove(username);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
