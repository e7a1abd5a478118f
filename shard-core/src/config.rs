//! Layered root configuration, aggregating each component's config struct.
//!
//! Grounded on `aerolithdb-core/src/config.rs`'s `AerolithsConfig::load()`/
//! `save()` round trip: try a JSON file, fall back to generated defaults
//! and persist them. The on-disk shape (`CoreConfigFile`) is flattened to
//! plain millisecond/integer fields since `std::time::Duration` has no
//! serde impl; `CoreConfig` itself stays the typed struct every component
//! constructor takes.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shard_failover::FailoverConfig;
use shard_health::HealthConfig;
use shard_pool::PoolConfig;
use shard_reshard::ReshardConfig;
use shard_router::RouterConfig;

const CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub data_dir: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/catalog".into(),
        }
    }
}

/// Root configuration owned by the orchestration crate. Every sub-config
/// carries the spec's stated defaults; individual fields remain directly
/// constructible for embedding and tests, mirroring how the lineage's own
/// components are built in test fixtures.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub catalog: CatalogConfig,
    pub pool: PoolConfig,
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub failover: FailoverConfig,
    pub reshard: ReshardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoreConfigFile {
    catalog_data_dir: String,
    pool_max_open: usize,
    pool_max_idle: usize,
    pool_acquire_timeout_ms: u64,
    pool_probe_interval_ms: u64,
    pool_consecutive_failures_to_mark_down: u32,
    router_max_read_retries: u32,
    router_retry_backoff_cap_ms: u64,
    router_execute_deadline_ms: u64,
    health_probe_interval_ms: u64,
    health_lag_threshold: u64,
    failover_suspected_window_ms: u64,
    failover_max_promotion_retries: u32,
    failover_history_capacity: usize,
    failover_sweep_interval_ms: u64,
    reshard_max_phase_retries: u32,
    reshard_retry_backoff_base_ms: u64,
    reshard_retry_backoff_cap_ms: u64,
    reshard_max_tail_rounds: u32,
}

impl From<&CoreConfig> for CoreConfigFile {
    fn from(c: &CoreConfig) -> Self {
        Self {
            catalog_data_dir: c.catalog.data_dir.clone(),
            pool_max_open: c.pool.max_open,
            pool_max_idle: c.pool.max_idle,
            pool_acquire_timeout_ms: c.pool.acquire_timeout.as_millis() as u64,
            pool_probe_interval_ms: c.pool.probe_interval.as_millis() as u64,
            pool_consecutive_failures_to_mark_down: c.pool.consecutive_failures_to_mark_down,
            router_max_read_retries: c.router.max_read_retries,
            router_retry_backoff_cap_ms: c.router.retry_backoff_cap.as_millis() as u64,
            router_execute_deadline_ms: c.router.execute_deadline.as_millis() as u64,
            health_probe_interval_ms: c.health.probe_interval.as_millis() as u64,
            health_lag_threshold: c.health.lag_threshold,
            failover_suspected_window_ms: c.failover.suspected_window.as_millis() as u64,
            failover_max_promotion_retries: c.failover.max_promotion_retries,
            failover_history_capacity: c.failover.history_capacity,
            failover_sweep_interval_ms: c.failover.sweep_interval.as_millis() as u64,
            reshard_max_phase_retries: c.reshard.max_phase_retries,
            reshard_retry_backoff_base_ms: c.reshard.retry_backoff_base.as_millis() as u64,
            reshard_retry_backoff_cap_ms: c.reshard.retry_backoff_cap.as_millis() as u64,
            reshard_max_tail_rounds: c.reshard.max_tail_rounds,
        }
    }
}

impl From<CoreConfigFile> for CoreConfig {
    fn from(f: CoreConfigFile) -> Self {
        Self {
            catalog: CatalogConfig { data_dir: f.catalog_data_dir },
            pool: PoolConfig {
                max_open: f.pool_max_open,
                max_idle: f.pool_max_idle,
                acquire_timeout: Duration::from_millis(f.pool_acquire_timeout_ms),
                probe_interval: Duration::from_millis(f.pool_probe_interval_ms),
                consecutive_failures_to_mark_down: f.pool_consecutive_failures_to_mark_down,
            },
            router: RouterConfig {
                max_read_retries: f.router_max_read_retries,
                retry_backoff_cap: Duration::from_millis(f.router_retry_backoff_cap_ms),
                execute_deadline: Duration::from_millis(f.router_execute_deadline_ms),
            },
            health: HealthConfig {
                probe_interval: Duration::from_millis(f.health_probe_interval_ms),
                lag_threshold: f.health_lag_threshold,
            },
            failover: FailoverConfig {
                suspected_window: Duration::from_millis(f.failover_suspected_window_ms),
                max_promotion_retries: f.failover_max_promotion_retries,
                history_capacity: f.failover_history_capacity,
                sweep_interval: Duration::from_millis(f.failover_sweep_interval_ms),
            },
            reshard: ReshardConfig {
                max_phase_retries: f.reshard_max_phase_retries,
                retry_backoff_base: Duration::from_millis(f.reshard_retry_backoff_base_ms),
                retry_backoff_cap: Duration::from_millis(f.reshard_retry_backoff_cap_ms),
                max_tail_rounds: f.reshard_max_tail_rounds,
            },
        }
    }
}

impl CoreConfig {
    /// Reads `config.json` if present, otherwise writes out and returns a
    /// generated default — the same file-then-default pattern as the
    /// lineage's own root config.
    pub async fn load() -> Result<Self> {
        match tokio::fs::read_to_string(CONFIG_PATH).await {
            Ok(content) => {
                let file: CoreConfigFile =
                    serde_json::from_str(&content).context("failed to parse config.json")?;
                Ok(file.into())
            }
            Err(_) => {
                let default_config = Self::default();
                default_config.save().await?;
                Ok(default_config)
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = Path::new(CONFIG_PATH).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = CoreConfigFile::from(self);
        let content = serde_json::to_string_pretty(&file)?;
        tokio::fs::write(CONFIG_PATH, content).await?;
        Ok(())
    }
}
