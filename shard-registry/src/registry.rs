//! In-memory shard registry.
//!
//! Grounded on `StorageHierarchy::start_background_tasks`
//! (`aerolithdb-storage/src/lib.rs`, a single `start()` spawning a
//! maintenance loop) and `ConsensusEngine::message_processing_loop`
//! (`aerolithdb-consensus/src/engine.rs`, a `while let Some(msg) =
//! receiver.recv().await` dispatch loop), retargeted at catalog watch
//! events instead of consensus messages. The published snapshot is
//! RCU-style: `Arc<RwLock<Arc<RegistrySnapshot>>>` so readers only ever
//! clone a pointer, never hold the lock across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use shard_catalog::{CatalogError, CatalogStore, Shard, ShardStatus};
use shard_hash::HashFn;
use shard_ring::ConsistentHashRing;

use crate::error::RegistryError;

struct RegistrySnapshot {
    ring: ConsistentHashRing,
    shards: HashMap<String, Shard>,
}

impl RegistrySnapshot {
    fn build(hash_fn: &dyn HashFn, shards: Vec<Shard>) -> Self {
        let ring = ConsistentHashRing::build(
            hash_fn,
            shards
                .iter()
                .filter(|s| s.status == ShardStatus::Active)
                .map(|s| (s.id.as_str(), s.vnode_count)),
        );
        let shards = shards.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self { ring, shards }
    }
}

/// Authoritative in-process view of the catalog, rebuilt on every watch
/// event and published with a single atomic swap.
pub struct ShardRegistry {
    catalog: Arc<CatalogStore>,
    hash_fn: Arc<dyn HashFn>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ShardRegistry {
    pub fn new(catalog: Arc<CatalogStore>, hash_fn: Arc<dyn HashFn>) -> Self {
        Self {
            catalog,
            hash_fn,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot {
                ring: ConsistentHashRing::empty(),
                shards: HashMap::new(),
            })),
        }
    }

    /// Performs the initial full `list_shards`, builds the first snapshot,
    /// then spawns the watch-consumer task. Must be called on an `Arc`-owned
    /// registry so the background task can hold its own reference.
    pub async fn start(self: &Arc<Self>) -> Result<(), CatalogError> {
        self.rebuild_full()?;
        info!("shard registry started, watching catalog for changes");
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.watch_loop().await;
        });
        Ok(())
    }

    fn rebuild_full(&self) -> Result<(), CatalogError> {
        let shards = self.catalog.list_shards(None)?;
        let snapshot = RegistrySnapshot::build(self.hash_fn.as_ref(), shards);
        *self.snapshot.write() = Arc::new(snapshot);
        Ok(())
    }

    /// Runs until the process exits. A broken watch stream does not clear
    /// the published snapshot (§4.3: callers keep serving from the last
    /// good revision while a reconnector retries with backoff).
    async fn watch_loop(self: Arc<Self>) {
        loop {
            let mut events = Box::pin(self.catalog.watch_shards());
            while let Some(event) = events.next().await {
                debug!(kind = ?event.kind, "catalog watch event observed, rebuilding snapshot");
                if let Err(e) = self.rebuild_full() {
                    warn!(error = %e, "registry rebuild failed after watch event, keeping last snapshot");
                }
            }
            warn!("catalog watch stream ended, reconnecting after backoff");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub fn get(&self, shard_id: &str) -> Result<Shard, RegistryError> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .shards
            .get(shard_id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    /// Composes `ring.lookup` with shard retrieval; fails if the resolved
    /// shard is not in a routable status.
    pub fn resolve(&self, key: &[u8]) -> Result<Shard, RegistryError> {
        let snapshot = self.snapshot.read().clone();
        let shard_id = snapshot
            .ring
            .lookup(self.hash_fn.as_ref(), key)
            .map_err(|_| RegistryError::NoShard)?;
        let shard = snapshot
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        if !shard.is_routable() {
            return Err(RegistryError::NotRoutable(shard_id));
        }
        Ok(shard)
    }

    pub fn all(&self, client_app_id: Option<&str>) -> Vec<Shard> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .shards
            .values()
            .filter(|s| {
                client_app_id.map_or(true, |id| s.client_app_id.as_deref() == Some(id))
            })
            .cloned()
            .collect()
    }
}
