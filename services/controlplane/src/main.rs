//! Authorization service entry point.
//!
//! # Purpose
//! Wires configuration, the system of record, and the resource-tree cache,
//! builds the tree once, then serves the HTTP API and the metrics listener.
//!
//! # Notes
//! The `build_state` helper keeps wiring testable and minimizes main setup logic.
use anyhow::Context;
use controlplane::app::{AppState, build_router};
use controlplane::cache::memory::InMemoryModelCache;
use controlplane::cache::shared::SharedModelCache;
use controlplane::cache::{CacheConfig, ModelCache};
use controlplane::config::{self, CacheBackend, RecordsBackend};
use controlplane::observability;
use controlplane::store::RecordStore;
use controlplane::store::memory::InMemoryRecordStore;
use controlplane::store::postgres::{PostgresRecordStore, connect_pool};
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::ControlPlaneConfig::from_env_or_yaml()?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: config::ControlPlaneConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("tenant-controlplane");
    let state = build_state(config.clone()).await?;
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let app = build_router(state);

    let addr = config.bind_addr;
    tracing::info!(%addr, "authorization service listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {}
    }

    metrics_task.abort();
    let _ = metrics_task.await;
    Ok(())
}

async fn build_state(config: config::ControlPlaneConfig) -> anyhow::Result<AppState> {
    config.validate()?;
    let needs_pool = config.cache_backend == CacheBackend::Shared
        || config.records_backend == RecordsBackend::Postgres;
    let pool: Option<PgPool> = if needs_pool {
        let pg = config
            .postgres
            .as_ref()
            .context("postgres configuration missing")?;
        Some(connect_pool(pg, true).await?)
    } else {
        None
    };

    let records: Arc<dyn RecordStore> = match (config.records_backend, &pool) {
        (RecordsBackend::Postgres, Some(pool)) => {
            Arc::new(PostgresRecordStore::from_pool(pool.clone()))
        }
        (RecordsBackend::Postgres, None) => anyhow::bail!("postgres configuration missing"),
        (RecordsBackend::Memory, _) => Arc::new(InMemoryRecordStore::new()),
    };

    let cache_config = CacheConfig::from(&config);
    let cache: Arc<dyn ModelCache> = match (config.cache_backend, &pool) {
        (CacheBackend::Shared, Some(pool)) => Arc::new(SharedModelCache::new(
            pool.clone(),
            records.clone(),
            cache_config,
        )),
        (CacheBackend::Shared, None) => anyhow::bail!("postgres configuration missing"),
        (CacheBackend::Memory, _) => {
            Arc::new(InMemoryModelCache::new(records.clone(), &cache_config))
        }
    };

    let built = cache
        .build_if_not_exist()
        .await
        .context("build resource tree")?;
    tracing::info!(
        records = records.backend_name(),
        cache = cache.backend_name(),
        durable = records.is_durable(),
        built,
        "resource tree ready"
    );

    Ok(AppState::new(records, cache))
}
