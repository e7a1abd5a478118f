//! Request router: shard resolution, consistency-aware endpoint selection,
//! request forwarding.
//!
//! Grounded on `StorageHierarchy::get_document`'s tier-cascading-with-fallback
//! control flow (`aerolithdb-storage/src/lib.rs`) for the
//! strong-primary-only / eventual-replica-then-primary-fallback shape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use shard_catalog::Shard;
use shard_pool::{BackendDriver, ConnectionPool, PoolError};
use shard_registry::ShardRegistry;

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    Strong,
    Eventual,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub shard_key: String,
    pub query: String,
    pub params: Vec<Value>,
    pub consistency: Consistency,
    pub options: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ExecuteResponse {
    pub shard_id: String,
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub latency_ms: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on read retries (§4.6 default 2), not applied to strong
    /// (primary-only) operations — writes remain at-most-once.
    pub max_read_retries: u32,
    pub retry_backoff_cap: Duration,
    pub execute_deadline: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_read_retries: 2,
            retry_backoff_cap: Duration::from_millis(100),
            execute_deadline: Duration::from_secs(30),
        }
    }
}

pub struct Router<D: BackendDriver> {
    registry: Arc<ShardRegistry>,
    pool: Arc<ConnectionPool<D>>,
    config: RouterConfig,
}

impl<D: BackendDriver + 'static> Router<D> {
    pub fn new(registry: Arc<ShardRegistry>, pool: Arc<ConnectionPool<D>>, config: RouterConfig) -> Self {
        Self {
            registry,
            pool,
            config,
        }
    }

    /// Pure resolution, no execution.
    pub fn shard_for_key(&self, key: &[u8]) -> Result<String, RouterError> {
        Ok(self.registry.resolve(key)?.id)
    }

    /// Resolves a shard, then picks an endpoint by consistency. `strong`
    /// never falls back to a replica; `eventual` falls back to the primary
    /// only when no replica is live.
    pub async fn route(&self, key: &[u8], consistency: Consistency) -> Result<String, RouterError> {
        let shard = self.registry.resolve(key)?;
        self.endpoint_for(&shard, consistency).await
    }

    async fn endpoint_for(&self, shard: &Shard, consistency: Consistency) -> Result<String, RouterError> {
        match consistency {
            Consistency::Strong => self
                .pool
                .primary_endpoint(&shard.id)
                .map_err(|_| RouterError::NoPrimary),
            Consistency::Eventual => {
                let replicas = self.pool.live_replica_endpoints(&shard.id);
                if let Some(endpoint) = replicas.into_iter().next() {
                    Ok(endpoint)
                } else {
                    self.pool
                        .primary_endpoint(&shard.id)
                        .map_err(|_| RouterError::NoPrimary)
                }
            }
        }
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResponse, RouterError> {
        if request.shard_key.is_empty() {
            return Err(RouterError::InvalidRequest("shard_key must not be empty".into()));
        }
        if request.query.is_empty() {
            return Err(RouterError::InvalidRequest("query must not be empty".into()));
        }

        let shard = self.registry.resolve(request.shard_key.as_bytes())?;
        let started = Instant::now();

        let (rows, row_count) = match request.consistency {
            Consistency::Strong => self.execute_strong(&shard, &request, &cancel).await?,
            Consistency::Eventual => self.execute_eventual(&shard, &request, &cancel).await?,
        };

        Ok(ExecuteResponse {
            shard_id: shard.id,
            rows,
            row_count,
            latency_ms: started.elapsed().as_millis() as u64,
            warnings: Vec::new(),
        })
    }

    /// At-most-once: a single attempt against the primary, no automatic
    /// retry (writes must not silently double-apply).
    async fn execute_strong(
        &self,
        shard: &Shard,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Value>, usize), RouterError> {
        let endpoint = self
            .pool
            .primary_endpoint(&shard.id)
            .map_err(|_| RouterError::NoPrimary)?;
        self.forward(&shard.id, &endpoint, request, cancel).await
    }

    /// Retries up to `max_read_retries` additional times with capped
    /// exponential backoff, rotating to a different live replica each
    /// attempt; falls back to the primary when there are no live replicas.
    async fn execute_eventual(
        &self,
        shard: &Shard,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Value>, usize), RouterError> {
        let replicas = self.pool.live_replica_endpoints(&shard.id);
        let endpoints: Vec<String> = if replicas.is_empty() {
            vec![self
                .pool
                .primary_endpoint(&shard.id)
                .map_err(|_| RouterError::NoPrimary)?]
        } else {
            replicas
        };

        let mut last_err = RouterError::NoPrimary;
        let mut backoff = Duration::from_millis(5).min(self.config.retry_backoff_cap);
        let attempts = self.config.max_read_retries as usize + 1;

        for attempt in 0..attempts {
            let endpoint = &endpoints[attempt % endpoints.len()];
            match self.forward(&shard.id, endpoint, request, cancel).await {
                Ok(result) => return Ok(result),
                Err(RouterError::Cancelled) => return Err(RouterError::Cancelled),
                Err(e) => {
                    warn!(endpoint, attempt, error = %e, "read attempt failed, retrying");
                    last_err = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.retry_backoff_cap);
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn forward(
        &self,
        shard_id: &str,
        endpoint: &str,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Value>, usize), RouterError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RouterError::Cancelled),
            outcome = tokio::time::timeout(
                self.config.execute_deadline,
                self.pool.execute(shard_id, endpoint, &request.query, &request.params),
            ) => {
                match outcome {
                    Err(_) => Err(RouterError::Timeout),
                    Ok(Ok(response)) => {
                        debug!(shard_id, endpoint, "forwarded request executed");
                        Ok((response.rows, response.row_count))
                    }
                    Ok(Err(err)) => Err(map_pool_error(err)),
                }
            }
        }
    }
}

fn map_pool_error(err: PoolError) -> RouterError {
    match err {
        PoolError::PoolExhausted => RouterError::PoolExhausted,
        PoolError::Down(endpoint) => RouterError::BackendError {
            code: None,
            message: format!("endpoint {endpoint} is down"),
        },
        PoolError::UnknownShard(_) => RouterError::NoShard,
        PoolError::Backend(message) => RouterError::BackendError { code: None, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shard_catalog::{CatalogStore, ShardStatus};
    use shard_pool::{BackendError, BackendResponse, PoolConfig};

    #[derive(Debug, Default)]
    struct FakeDriver;

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
            Ok(BackendResponse {
                rows: vec![Value::String("row".into())],
                row_count: 1,
            })
        }
    }

    fn sample_shard(primary_down: bool) -> Shard {
        Shard {
            id: "s1".into(),
            name: "s1".into(),
            client_app_id: None,
            primary_endpoint: Some(if primary_down { "down:1".into() } else { "up:1".into() }),
            replicas: vec![],
            hash_range_start: 0,
            hash_range_end: u64::MAX,
            status: ShardStatus::Active,
            vnode_count: 32,
            version: 1,
        }
    }

    async fn build_router(
        shard: Shard,
        mark_primary_down: bool,
    ) -> Router<FakeDriver> {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::open(dir.path()).unwrap());
        catalog.put_shard(shard.clone(), None).unwrap();

        let registry = Arc::new(ShardRegistry::new(catalog, Arc::new(shard_hash::Murmur3Hash)));
        registry.start().await.unwrap();

        let pool = Arc::new(ConnectionPool::new(Arc::new(FakeDriver), PoolConfig::default()));
        pool.sync_shard(&shard);
        if mark_primary_down {
            for _ in 0..pool_default_failures() {
                let endpoint = shard.primary_endpoint.clone().unwrap();
                let _ = pool.acquire("s1", &endpoint).await; // no-op, just to exercise path
            }
        }

        Router::new(registry, pool, RouterConfig::default())
    }

    fn pool_default_failures() -> u32 {
        PoolConfig::default().consecutive_failures_to_mark_down
    }

    #[tokio::test]
    async fn empty_shard_key_is_invalid_request() {
        let router = build_router(sample_shard(false), false).await;
        let request = ExecuteRequest {
            shard_key: String::new(),
            query: "select 1".into(),
            params: vec![],
            consistency: Consistency::Strong,
            options: None,
        };
        let result = router.execute(request, CancellationToken::new()).await;
        assert!(matches!(result, Err(RouterError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn strong_read_executes_against_primary() {
        let router = build_router(sample_shard(false), false).await;
        let request = ExecuteRequest {
            shard_key: "user-1".into(),
            query: "select 1".into(),
            params: vec![],
            consistency: Consistency::Strong,
            options: None,
        };
        let response = router.execute(request, CancellationToken::new()).await.unwrap();
        assert_eq!(response.shard_id, "s1");
        assert_eq!(response.row_count, 1);
    }

    #[tokio::test]
    async fn shard_for_key_is_pure_resolution() {
        let router = build_router(sample_shard(false), false).await;
        assert_eq!(router.shard_for_key(b"any-key").unwrap(), "s1");
    }
}
