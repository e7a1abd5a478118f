//! Per-shard failover coordinator: `stable -> suspected -> electing ->
//! promoting -> catalog_update -> stable`.
//!
//! Grounded on `ConsensusEngine`'s propose/vote/commit state shape
//! (`aerolithdb-consensus/src/engine.rs`) for the transition-with-retry
//! design, and on its `Arc<DashMap<ProposalId, Proposal>>` bookkeeping
//! style for the per-shard state table and bounded history buffer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use shard_catalog::{CatalogError, CatalogStore, Shard, ShardStatus};
use shard_health::{HealthController, HealthStatus};
use shard_pool::{BackendDriver, ConnectionPool};
use shard_registry::ShardRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Stable,
    Suspected,
    Electing,
    Promoting,
    CatalogUpdate,
}

#[derive(Debug, Clone)]
pub struct FailoverEvent {
    pub shard_id: String,
    pub from: FailoverState,
    pub to: FailoverState,
    pub detail: Option<String>,
}

#[derive(Debug, Error, Clone)]
pub enum FailoverError {
    #[error("no replica available to promote for shard {0}")]
    NoCandidate(String),
    #[error("promotion retries exhausted for shard {0}")]
    RetriesExhausted(String),
    #[error("catalog error: {0}")]
    Catalog(String),
}

impl From<CatalogError> for FailoverError {
    fn from(e: CatalogError) -> Self {
        FailoverError::Catalog(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// How long a shard must stay `unhealthy` before failover triggers.
    pub suspected_window: Duration,
    pub max_promotion_retries: u32,
    pub history_capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            suspected_window: Duration::from_secs(30),
            max_promotion_retries: 3,
            history_capacity: 200,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

struct ShardFailoverState {
    state: FailoverState,
    suspected_since: Option<Instant>,
    promotion_attempts: u32,
}

impl Default for ShardFailoverState {
    fn default() -> Self {
        Self {
            state: FailoverState::Stable,
            suspected_since: None,
            promotion_attempts: 0,
        }
    }
}

pub struct FailoverCoordinator<D: BackendDriver> {
    catalog: Arc<CatalogStore>,
    registry: Arc<ShardRegistry>,
    pool: Arc<ConnectionPool<D>>,
    health: Arc<HealthController<D>>,
    config: FailoverConfig,
    states: DashMap<String, Mutex<ShardFailoverState>>,
    history: Mutex<VecDeque<FailoverEvent>>,
}

impl<D: BackendDriver + 'static> FailoverCoordinator<D> {
    pub fn new(
        catalog: Arc<CatalogStore>,
        registry: Arc<ShardRegistry>,
        pool: Arc<ConnectionPool<D>>,
        health: Arc<HealthController<D>>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            pool,
            health,
            config,
            states: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.sweep_loop().await;
        });
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            interval.tick().await;
            for shard in self.registry.all(None) {
                if let Err(e) = self.evaluate(&shard.id).await {
                    warn!(shard_id = %shard.id, error = %e, "failover evaluation failed");
                }
            }
        }
    }

    fn entry(&self, shard_id: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<ShardFailoverState>> {
        self.states
            .entry(shard_id.to_string())
            .or_insert_with(|| Mutex::new(ShardFailoverState::default()));
        self.states.get(shard_id).unwrap()
    }

    fn record(&self, event: FailoverEvent) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        info!(shard_id = %event.shard_id, from = ?event.from, to = ?event.to, "failover transition");
        history.push_back(event);
    }

    /// Drives one shard's state machine forward based on its current
    /// health report. Called from the sweep loop; also callable directly
    /// in tests.
    pub async fn evaluate(&self, shard_id: &str) -> Result<(), FailoverError> {
        let Some(report) = self.health.get(shard_id) else {
            return Ok(());
        };
        let entry = self.entry(shard_id);
        let current = { entry.lock().state };

        match current {
            FailoverState::Stable => {
                if report.status == HealthStatus::Unhealthy {
                    let mut guard = entry.lock();
                    guard.state = FailoverState::Suspected;
                    guard.suspected_since = Some(Instant::now());
                    drop(guard);
                    self.record(FailoverEvent {
                        shard_id: shard_id.to_string(),
                        from: FailoverState::Stable,
                        to: FailoverState::Suspected,
                        detail: None,
                    });
                }
                Ok(())
            }
            FailoverState::Suspected => {
                if report.status != HealthStatus::Unhealthy {
                    let mut guard = entry.lock();
                    guard.state = FailoverState::Stable;
                    guard.suspected_since = None;
                    guard.promotion_attempts = 0;
                    drop(guard);
                    self.record(FailoverEvent {
                        shard_id: shard_id.to_string(),
                        from: FailoverState::Suspected,
                        to: FailoverState::Stable,
                        detail: Some("recovered before window elapsed".into()),
                    });
                    return Ok(());
                }
                let elapsed = entry
                    .lock()
                    .suspected_since
                    .map(|since| since.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.suspected_window {
                    entry.lock().state = FailoverState::Electing;
                    drop(entry);
                    self.record(FailoverEvent {
                        shard_id: shard_id.to_string(),
                        from: FailoverState::Suspected,
                        to: FailoverState::Electing,
                        detail: None,
                    });
                    self.run_election(shard_id).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Explicit bypass of election; still goes through promotion and the
    /// CAS-guarded catalog update.
    pub async fn promote(&self, shard_id: &str, replica_endpoint: &str) -> Result<(), FailoverError> {
        self.entry(shard_id).lock().state = FailoverState::Electing;
        self.promote_candidate(shard_id, replica_endpoint.to_string()).await
    }

    async fn run_election(&self, shard_id: &str) -> Result<(), FailoverError> {
        let mut candidates = Vec::new();
        for endpoint in self.pool.live_replica_endpoints(shard_id) {
            let lag = self.pool.get_lag(&endpoint).await;
            candidates.push((lag, endpoint));
        }
        // Highest freshness (lowest lag) first, lexicographically smallest
        // endpoint as tie-break.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let Some((_, winner)) = candidates.into_iter().next() else {
            self.entry(shard_id).lock().state = FailoverState::Suspected;
            return Err(FailoverError::NoCandidate(shard_id.to_string()));
        };

        self.promote_candidate(shard_id, winner).await
    }

    async fn promote_candidate(&self, shard_id: &str, winner: String) -> Result<(), FailoverError> {
        loop {
            self.entry(shard_id).lock().state = FailoverState::Promoting;
            self.record(FailoverEvent {
                shard_id: shard_id.to_string(),
                from: FailoverState::Electing,
                to: FailoverState::Promoting,
                detail: Some(winner.clone()),
            });

            let promoted = self.pool.promote(shard_id, &winner).await;
            if let Err(e) = promoted {
                let attempts = {
                    let mut guard = self.entry(shard_id).lock();
                    guard.promotion_attempts += 1;
                    guard.promotion_attempts
                };
                warn!(shard_id, endpoint = %winner, error = %e, attempts, "promotion failed");
                if attempts >= self.config.max_promotion_retries {
                    self.entry(shard_id).lock().state = FailoverState::Suspected;
                    return Err(FailoverError::RetriesExhausted(shard_id.to_string()));
                }
                self.entry(shard_id).lock().state = FailoverState::Electing;
                continue;
            }

            self.entry(shard_id).lock().state = FailoverState::CatalogUpdate;
            match self.apply_catalog_update(shard_id, &winner).await {
                Ok(()) => {
                    let mut guard = self.entry(shard_id).lock();
                    guard.state = FailoverState::Stable;
                    guard.suspected_since = None;
                    guard.promotion_attempts = 0;
                    drop(guard);
                    self.record(FailoverEvent {
                        shard_id: shard_id.to_string(),
                        from: FailoverState::CatalogUpdate,
                        to: FailoverState::Stable,
                        detail: Some(winner.clone()),
                    });
                    return Ok(());
                }
                Err(FailoverError::Catalog(msg)) if msg.contains("conflict") => {
                    self.entry(shard_id).lock().state = FailoverState::Electing;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_catalog_update(&self, shard_id: &str, promoted: &str) -> Result<(), FailoverError> {
        let shard = self.catalog.get_shard(shard_id)?;
        let old_primary = shard.primary_endpoint.clone();
        let mut replicas: Vec<String> = shard
            .replicas
            .iter()
            .filter(|r| r.as_str() != promoted)
            .cloned()
            .collect();
        if let Some(old) = old_primary {
            replicas.push(old);
        }

        let updated = Shard {
            primary_endpoint: Some(promoted.to_string()),
            replicas,
            status: ShardStatus::Active,
            ..shard.clone()
        };

        match self.catalog.put_shard(updated, Some(shard.version)) {
            Ok(_) => Ok(()),
            Err(CatalogError::Conflict { .. }) => Err(FailoverError::Catalog("conflict".into())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state(&self, shard_id: &str) -> FailoverState {
        self.entry(shard_id).lock().state
    }

    pub fn history(&self) -> Vec<FailoverEvent> {
        self.history.lock().iter().cloned().collect()
    }
}
