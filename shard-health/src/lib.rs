//! Periodic shard health derivation.
//!
//! Grounded on `ConsensusEngine::start_periodic_tasks`
//! (`aerolithdb-consensus/src/engine.rs`) for the `tokio::time::interval`
//! background-loop shape, and on `replication.rs`'s `ReplicationStatus`
//! (`available_replicas`/`unavailable_replicas`/`replication_health`) for
//! the health-summary vocabulary.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use shard_pool::{BackendDriver, ConnectionPool};
use shard_registry::ShardRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct ShardHealth {
    pub shard_id: String,
    pub status: HealthStatus,
    pub primary_up: bool,
    pub live_replicas: usize,
    pub total_replicas: usize,
    pub max_observed_lag: u64,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    /// Lag values above this threshold count toward `degraded`. `0` from
    /// `get_lag` means unknown and never contributes on its own (§4.7).
    pub lag_threshold: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            lag_threshold: 5_000,
        }
    }
}

/// Periodically re-derives `{healthy, degraded, unhealthy}` per shard from
/// the connection pool's liveness state and lag readings. Feeds the
/// failover coordinator and the router's endpoint-down marks; never
/// changes routing itself.
pub struct HealthController<D: BackendDriver> {
    registry: Arc<ShardRegistry>,
    pool: Arc<ConnectionPool<D>>,
    config: HealthConfig,
    reports: DashMap<String, ShardHealth>,
}

impl<D: BackendDriver + 'static> HealthController<D> {
    pub fn new(registry: Arc<ShardRegistry>, pool: Arc<ConnectionPool<D>>, config: HealthConfig) -> Self {
        Self {
            registry,
            pool,
            config,
            reports: DashMap::new(),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.probe_loop().await;
        });
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        loop {
            interval.tick().await;
            self.refresh_all().await;
        }
    }

    async fn refresh_all(&self) {
        for shard in self.registry.all(None) {
            let report = self.derive(&shard.id).await;
            debug!(shard_id = %shard.id, status = ?report.status, "health report refreshed");
            self.reports.insert(shard.id.clone(), report);
        }
    }

    async fn derive(&self, shard_id: &str) -> ShardHealth {
        let primary_up = self.pool.primary_endpoint(shard_id).is_ok();
        let replicas = self.pool.live_replica_endpoints(shard_id);
        let total_replicas = self
            .registry
            .get(shard_id)
            .map(|s| s.replicas.len())
            .unwrap_or(0);
        let live_replicas = replicas.len();

        let mut max_observed_lag = 0;
        for endpoint in &replicas {
            let lag = self.pool.get_lag(endpoint).await;
            max_observed_lag = max_observed_lag.max(lag);
        }

        let status = if !primary_up {
            HealthStatus::Unhealthy
        } else if live_replicas < total_replicas || max_observed_lag > self.config.lag_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ShardHealth {
            shard_id: shard_id.to_string(),
            status,
            primary_up,
            live_replicas,
            total_replicas,
            max_observed_lag,
        }
    }

    pub fn get(&self, shard_id: &str) -> Option<ShardHealth> {
        self.reports.get(shard_id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<ShardHealth> {
        self.reports.iter().map(|r| r.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use shard_catalog::{CatalogStore, Shard, ShardStatus};
    use shard_hash::Murmur3Hash;
    use shard_pool::{BackendError, BackendResponse, PoolConfig};

    #[derive(Debug, Default)]
    struct FakeDriver {
        lag: DashMap<String, u64>,
    }

    #[async_trait]
    impl BackendDriver for FakeDriver {
        async fn ping(&self, _endpoint: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn execute(
            &self,
            _endpoint: &str,
            _query: &str,
            _params: &[Value],
        ) -> Result<BackendResponse, BackendError> {
            Ok(BackendResponse { rows: vec![], row_count: 0 })
        }

        async fn get_lag(&self, endpoint: &str) -> u64 {
            self.lag.get(endpoint).map(|v| *v).unwrap_or(0)
        }
    }

    fn shard() -> Shard {
        Shard {
            id: "s1".into(),
            name: "s1".into(),
            client_app_id: None,
            primary_endpoint: Some("p1".into()),
            replicas: vec!["r1".into(), "r2".into()],
            hash_range_start: 0,
            hash_range_end: u64::MAX,
            status: ShardStatus::Active,
            vnode_count: 32,
            version: 1,
        }
    }

    async fn setup(driver: Arc<FakeDriver>) -> (Arc<HealthController<FakeDriver>>, Arc<ConnectionPool<FakeDriver>>) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::open(dir.path()).unwrap());
        catalog.put_shard(shard(), None).unwrap();
        let registry = Arc::new(ShardRegistry::new(catalog, Arc::new(Murmur3Hash)));
        registry.start().await.unwrap();

        let pool = Arc::new(ConnectionPool::new(driver, PoolConfig::default()));
        pool.sync_shard(&shard());

        let controller = Arc::new(HealthController::new(registry, pool.clone(), HealthConfig::default()));
        (controller, pool)
    }

    #[tokio::test]
    async fn fully_up_shard_is_healthy() {
        let (controller, _pool) = setup(Arc::new(FakeDriver::default())).await;
        controller.refresh_all().await;
        let report = controller.get("s1").unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn high_lag_is_degraded_not_unhealthy() {
        let driver = Arc::new(FakeDriver::default());
        driver.lag.insert("r1".into(), 50_000);
        let (controller, _pool) = setup(driver).await;
        controller.refresh_all().await;
        let report = controller.get("s1").unwrap();
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn unknown_zero_lag_does_not_cause_degraded() {
        let (controller, _pool) = setup(Arc::new(FakeDriver::default())).await;
        controller.refresh_all().await;
        let report = controller.get("s1").unwrap();
        assert_eq!(report.max_observed_lag, 0);
        assert_eq!(report.status, HealthStatus::Healthy);
    }
}
