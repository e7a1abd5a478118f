//! Orchestration: one instance of every component behind a single `Core`
//! handle, wired and started/stopped in dependency order.
//!
//! Grounded on `aerolithdb-core/src/lib.rs`'s `AerolithsDB` struct: fixed
//! dependency-ordered `start()`/reverse-order `stop()`, `Arc`-held
//! subsystem handles, `anyhow::Result` at the orchestration boundary.

mod config;

pub use config::{CatalogConfig, CoreConfig};

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use shard_catalog::CatalogStore;
use shard_failover::FailoverCoordinator;
use shard_health::HealthController;
use shard_pool::ConnectionPool;
use shard_registry::ShardRegistry;
use shard_reshard::{DataMoverDriver, ReshardCoordinator};
use shard_router::Router;

/// Owns the catalog, registry, pool, router, health controller, failover
/// coordinator, and reshard coordinator for one deployment. `D` is the
/// single `BackendDriver`/`DataMoverDriver` implementation shared by the
/// pool and the reshard coordinator — the only place a concrete database
/// protocol plugs in.
pub struct Core<D: DataMoverDriver + 'static> {
    config: CoreConfig,
    pub catalog: Arc<CatalogStore>,
    pub registry: Arc<ShardRegistry>,
    pub pool: Arc<ConnectionPool<D>>,
    pub router: Arc<Router<D>>,
    pub health: Arc<HealthController<D>>,
    pub failover: Arc<FailoverCoordinator<D>>,
    pub reshard: Arc<ReshardCoordinator<D>>,
}

impl<D: DataMoverDriver + 'static> Core<D> {
    /// Wires every component from a config and a driver. Does not start
    /// any background task; call `start()` for that.
    pub fn new(config: CoreConfig, driver: Arc<D>, hash_fn: Arc<dyn shard_hash::HashFn>) -> Result<Self> {
        info!("wiring core components");

        let catalog = Arc::new(
            CatalogStore::open(&config.catalog.data_dir)
                .context("failed to open catalog store")?,
        );
        let registry = Arc::new(ShardRegistry::new(Arc::clone(&catalog), hash_fn));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&driver), config.pool.clone()));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            config.router.clone(),
        ));
        let health = Arc::new(HealthController::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            config.health.clone(),
        ));
        let failover = Arc::new(FailoverCoordinator::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&health),
            config.failover.clone(),
        ));
        let reshard = Arc::new(ReshardCoordinator::new(
            Arc::clone(&catalog),
            Arc::clone(&driver),
            config.reshard.clone(),
        ));

        Ok(Self {
            config,
            catalog,
            registry,
            pool,
            router,
            health,
            failover,
            reshard,
        })
    }

    /// Starts background tasks in dependency order: registry must observe
    /// the catalog before the pool syncs shard endpoints, health depends
    /// on the pool, failover depends on health.
    pub async fn start(&self) -> Result<()> {
        info!("starting core components");

        self.registry.start().await.context("registry failed to start")?;
        for shard in self.registry.all(None) {
            self.pool.sync_shard(&shard);
        }
        self.pool.start().await;
        self.health.start().await;
        self.failover.start().await;

        info!("core started");
        Ok(())
    }

    /// Graceful shutdown is a no-op beyond logging: every background task
    /// here is a detached `tokio::spawn` loop with no persistent
    /// connections to drain (the `BackendDriver` owns those, out of
    /// scope). Kept as an explicit method so callers have one lifecycle
    /// hook to await, matching the lineage's `start`/`stop` pairing.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping core");
        Ok(())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}
