//! Named lease lock over the shared cache table.
//!
//! # Protocol
//! - The lease is the row `lock_{name}` in `model_cache`; its value carries an
//!   owner token and the acquisition time, its `expires_at` bounds how long a
//!   crashed holder can block others.
//! - Acquisition is one statement: insert the row, or take it over if the
//!   current lease has expired. There is no read-then-write window.
//! - Waiters `LISTEN` on `free_{name}`; the holder deletes its row and then
//!   notifies. A bounded poll covers notifications missed while subscribing.
//! - Release only deletes a row that still carries the caller's owner token, so
//!   a holder whose lease expired cannot free someone else's lease.
//!
//! A timed-out acquisition is [`CacheError::LockTimeout`]; it is contention,
//! not a correctness failure, and callers may retry.
use super::{CacheError, CacheResult};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_POLL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct DistributedLock {
    pool: PgPool,
    name: String,
    timeout: Duration,
    poll: Duration,
}

/// Proof of a held lease; pass it back to [`DistributedLock::unlock`].
#[derive(Debug)]
pub struct Lease {
    owner: String,
    acquired: Instant,
}

impl Lease {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn held_for(&self) -> Duration {
        self.acquired.elapsed()
    }
}

impl DistributedLock {
    pub fn new(pool: PgPool, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            name: name.into(),
            timeout,
            poll: DEFAULT_POLL.min(timeout),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn lock_key(&self) -> String {
        format!("lock_{}", self.name)
    }

    pub fn release_channel(&self) -> String {
        format!("free_{}", self.name)
    }

    /// Block until the lease is ours or `timeout` elapses.
    pub async fn lock(&self) -> CacheResult<Lease> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let owner = Uuid::new_v4().to_string();
        let mut listener: Option<PgListener> = None;
        let mut subscribed = false;

        loop {
            if self.try_acquire(&owner).await? {
                metrics::histogram!("model_cache_lock_wait_seconds")
                    .record(started.elapsed().as_secs_f64());
                return Ok(Lease {
                    owner,
                    acquired: Instant::now(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(lock = %self.name, waited_ms = self.timeout.as_millis() as u64, "lock acquisition timed out");
                return Err(CacheError::LockTimeout {
                    name: self.name.clone(),
                    waited: self.timeout,
                });
            }

            if !subscribed {
                // Subscribe once, then retry before waiting so a release that
                // happened in between is not missed.
                subscribed = true;
                listener = self.subscribe().await;
                continue;
            }

            let wait = (deadline - now).min(self.poll);
            match listener.as_mut() {
                Some(active) => match tokio::time::timeout(wait, active.recv()).await {
                    Ok(Ok(_)) | Err(_) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(lock = %self.name, error = %err, "release listener failed; polling");
                        listener = None;
                    }
                },
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Release a lease. Returns `false` if it had already expired and been
    /// taken over or swept.
    pub async fn unlock(&self, lease: Lease) -> CacheResult<bool> {
        let deleted = sqlx::query("DELETE FROM model_cache WHERE key = $1 AND value ->> 'owner' = $2")
            .bind(self.lock_key())
            .bind(&lease.owner)
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;
        if !deleted {
            tracing::warn!(
                lock = %self.name,
                held_ms = lease.held_for().as_millis() as u64,
                "lease expired before release"
            );
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(self.release_channel())
            .bind(&lease.owner)
            .execute(&self.pool)
            .await?;
        Ok(deleted)
    }

    async fn try_acquire(&self, owner: &str) -> CacheResult<bool> {
        let value = json!({
            "owner": owner,
            "acquiredAt": chrono::Utc::now(),
        });
        let result = sqlx::query(
            r#"INSERT INTO model_cache (key, value, expires_at)
               VALUES ($1, $2, now() + make_interval(secs => $3))
               ON CONFLICT (key) DO UPDATE
                   SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                   WHERE model_cache.expires_at IS NOT NULL AND model_cache.expires_at <= now()"#,
        )
        .bind(self.lock_key())
        .bind(value)
        .bind(self.timeout.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn subscribe(&self) -> Option<PgListener> {
        let channel = self.release_channel();
        let mut listener = match PgListener::connect_with(&self.pool).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(lock = %self.name, error = %err, "cannot open release listener; polling");
                return None;
            }
        };
        if let Err(err) = listener.listen(&channel).await {
            tracing::warn!(lock = %self.name, error = %err, "cannot listen for release; polling");
            return None;
        }
        Some(listener)
    }
}
