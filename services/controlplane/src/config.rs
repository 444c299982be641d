use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

/// Which cache backend serves entity and authority lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Shared,
}

/// Which system-of-record implementation the resolver and bootstrap read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordsBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

// Authorization service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub cache_backend: CacheBackend,
    pub records_backend: RecordsBackend,
    pub postgres: Option<PostgresConfig>,
    pub authority_ttl_secs: u64,
    pub authority_capacity: usize,
    pub lock_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub expiry_sweep_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ControlPlaneConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    cache_backend: Option<CacheBackend>,
    records_backend: Option<RecordsBackend>,
    postgres: Option<PostgresConfig>,
    authority_ttl_secs: Option<u64>,
    authority_capacity: Option<usize>,
    lock_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
    expiry_sweep_secs: Option<u64>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cache_backend: CacheBackend::Memory,
            records_backend: RecordsBackend::Memory,
            postgres: None,
            authority_ttl_secs: 180 * 60,
            authority_capacity: 128,
            lock_timeout_ms: 5_000,
            operation_timeout_ms: 2_000,
            expiry_sweep_secs: 60,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("parse {name}")),
        Err(_) => Ok(default),
    }
}

fn parse_cache_backend(value: &str) -> Result<CacheBackend> {
    match value {
        "memory" => Ok(CacheBackend::Memory),
        "shared" => Ok(CacheBackend::Shared),
        other => bail!("unknown cache backend: {other}"),
    }
}

fn parse_records_backend(value: &str) -> Result<RecordsBackend> {
    match value {
        "memory" => Ok(RecordsBackend::Memory),
        "postgres" => Ok(RecordsBackend::Postgres),
        other => bail!("unknown records backend: {other}"),
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let bind_addr = env_parse("GEMS_AUTHZ_BIND", defaults.bind_addr)?;
        let metrics_bind = env_parse("GEMS_AUTHZ_METRICS_BIND", defaults.metrics_bind)?;
        let cache_backend = match std::env::var("GEMS_AUTHZ_CACHE_BACKEND") {
            Ok(value) => parse_cache_backend(&value).context("parse GEMS_AUTHZ_CACHE_BACKEND")?,
            Err(_) => defaults.cache_backend,
        };
        let records_backend = match std::env::var("GEMS_AUTHZ_RECORDS_BACKEND") {
            Ok(value) => {
                parse_records_backend(&value).context("parse GEMS_AUTHZ_RECORDS_BACKEND")?
            }
            Err(_) => defaults.records_backend,
        };
        let postgres = match std::env::var("GEMS_AUTHZ_DATABASE_URL") {
            Ok(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse(
                    "GEMS_AUTHZ_PG_MAX_CONNECTIONS",
                    default_max_connections(),
                )?,
                connect_timeout_ms: env_parse(
                    "GEMS_AUTHZ_PG_CONNECT_TIMEOUT_MS",
                    default_connect_timeout_ms(),
                )?,
                acquire_timeout_ms: env_parse(
                    "GEMS_AUTHZ_PG_ACQUIRE_TIMEOUT_MS",
                    default_acquire_timeout_ms(),
                )?,
            }),
            Err(_) => None,
        };
        Ok(Self {
            bind_addr,
            metrics_bind,
            cache_backend,
            records_backend,
            postgres,
            authority_ttl_secs: env_parse(
                "GEMS_AUTHZ_AUTHORITY_TTL_SECS",
                defaults.authority_ttl_secs,
            )?,
            authority_capacity: env_parse(
                "GEMS_AUTHZ_AUTHORITY_CAPACITY",
                defaults.authority_capacity,
            )?,
            lock_timeout_ms: env_parse("GEMS_AUTHZ_LOCK_TIMEOUT_MS", defaults.lock_timeout_ms)?,
            operation_timeout_ms: env_parse(
                "GEMS_AUTHZ_OPERATION_TIMEOUT_MS",
                defaults.operation_timeout_ms,
            )?,
            expiry_sweep_secs: env_parse(
                "GEMS_AUTHZ_EXPIRY_SWEEP_SECS",
                defaults.expiry_sweep_secs,
            )?,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("GEMS_AUTHZ_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read GEMS_AUTHZ_CONFIG: {path}"))?;
            let override_cfg: ControlPlaneConfigOverride = serde_yaml::from_str(&contents)
                .with_context(|| "parse authorization service config yaml")?;
            config.apply(override_cfg)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ControlPlaneConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.cache_backend {
            self.cache_backend = value;
        }
        if let Some(value) = override_cfg.records_backend {
            self.records_backend = value;
        }
        if let Some(value) = override_cfg.postgres {
            self.postgres = Some(value);
        }
        if let Some(value) = override_cfg.authority_ttl_secs {
            self.authority_ttl_secs = value;
        }
        if let Some(value) = override_cfg.authority_capacity {
            self.authority_capacity = value;
        }
        if let Some(value) = override_cfg.lock_timeout_ms {
            self.lock_timeout_ms = value;
        }
        if let Some(value) = override_cfg.operation_timeout_ms {
            self.operation_timeout_ms = value;
        }
        if let Some(value) = override_cfg.expiry_sweep_secs {
            self.expiry_sweep_secs = value;
        }
        Ok(())
    }

    /// Reject combinations that cannot be wired at startup.
    pub fn validate(&self) -> Result<()> {
        let needs_postgres = self.cache_backend == CacheBackend::Shared
            || self.records_backend == RecordsBackend::Postgres;
        if needs_postgres && self.postgres.is_none() {
            bail!("postgres configuration missing");
        }
        if self.authority_capacity == 0 {
            bail!("authority_capacity must be greater than zero");
        }
        if self.expiry_sweep_secs == 0 {
            bail!("expiry_sweep_secs must be greater than zero");
        }
        if self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be greater than zero");
        }
        // The lease lives for lock_timeout; the guarded write must finish first.
        if self.lock_timeout_ms <= self.operation_timeout_ms {
            bail!(
                "lock_timeout_ms ({}) must exceed operation_timeout_ms ({})",
                self.lock_timeout_ms,
                self.operation_timeout_ms
            );
        }
        Ok(())
    }

    pub fn authority_ttl(&self) -> Duration {
        Duration::from_secs(self.authority_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_secs)
    }
}
