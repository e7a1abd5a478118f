//! Sled-backed catalog store.
//!
//! Grounded on `aerolithdb-storage/src/backends.rs`'s `LocalSSDCache` /
//! `DistributedStorage` (`sled::open`, insert-then-flush, remove) store
//! shape, generalized with JSON values and per-key CAS via a striped
//! `parking_lot::Mutex` (sled has no native read-modify-write CAS over an
//! opaque blob). `watch` wraps sled's own `watch_prefix`.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::Stream;
use parking_lot::Mutex;
use sled::transaction::TransactionResult;
use tracing::{debug, warn};

use crate::error::CatalogError;
use crate::model::{ReshardJob, Shard, ShardStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum WatchedShard {
    Upserted(Shard),
    Deleted(String),
}

#[derive(Debug, Clone)]
pub enum WatchedJob {
    Upserted(ReshardJob),
    Deleted(String),
}

#[derive(Debug, Clone)]
pub struct ShardWatchEvent {
    pub kind: WatchEventKind,
    pub shard: WatchedShard,
}

#[derive(Debug, Clone)]
pub struct JobWatchEvent {
    pub kind: WatchEventKind,
    pub job: WatchedJob,
}

/// Durable, watched key-value store of `shards/<shard_id>` and
/// `reshard_jobs/<job_id>` records.
pub struct CatalogStore {
    _db: sled::Db,
    shards: sled::Tree,
    jobs: sled::Tree,
    shard_locks: DashMap<String, Arc<Mutex<()>>>,
    job_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CatalogStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let db = sled::open(data_dir).map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let shards = db.open_tree("shards")?;
        let jobs = db.open_tree("reshard_jobs")?;
        Ok(Self {
            _db: db,
            shards,
            jobs,
            shard_locks: DashMap::new(),
            job_locks: DashMap::new(),
        })
    }

    fn lock_for(map: &DashMap<String, Arc<Mutex<()>>>, key: &str) -> Arc<Mutex<()>> {
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // --- shards ---

    /// Rejects `active` shards with no `primary_endpoint` at write time
    /// (decided open question, see DESIGN.md): this is a caller input
    /// defect, not a concurrent-write race, so it surfaces `InvalidRequest`
    /// rather than `Conflict`.
    pub fn put_shard(
        &self,
        mut shard: Shard,
        expected_version: Option<u64>,
    ) -> Result<Shard, CatalogError> {
        if shard.status == ShardStatus::Active && shard.primary_endpoint.is_none() {
            return Err(CatalogError::InvalidRequest(
                "active shard requires a non-empty primary_endpoint".into(),
            ));
        }

        let lock = Self::lock_for(&self.shard_locks, &shard.id);
        let _guard = lock.lock();

        let existing = self.get_shard_raw(&shard.id)?;
        if let (Some(current), Some(expected)) = (&existing, expected_version) {
            if current.version != expected {
                return Err(CatalogError::Conflict {
                    expected,
                    actual: current.version,
                });
            }
        }

        shard.version = existing.as_ref().map(|s| s.version + 1).unwrap_or(1);
        let bytes = serde_json::to_vec(&shard)?;
        self.shards.insert(shard.id.as_bytes(), bytes)?;
        self.shards.flush()?;
        debug!(shard_id = %shard.id, version = shard.version, "put_shard committed");
        Ok(shard)
    }

    /// Atomically applies the reshard cutover's target-activation and
    /// source-range updates as a single sled transaction over the shards
    /// tree (§4.9 step 5: "atomically update the catalog in a single
    /// transaction"). Exclusivity is the caller's responsibility — only the
    /// owning reshard job touches these shard ids (`has_active_job_for`).
    pub fn apply_cutover(&self, updates: Vec<Shard>) -> Result<(), CatalogError> {
        use sled::transaction::{ConflictableTransactionError, TransactionError};

        let result: TransactionResult<(), CatalogError> = self.shards.transaction(|tx| {
            for shard in &updates {
                let mut versioned = shard.clone();
                let current_version = match tx.get(shard.id.as_bytes())? {
                    Some(bytes) => serde_json::from_slice::<Shard>(&bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(CatalogError::Serde(e)))?
                        .version,
                    None => 0,
                };
                versioned.version = current_version + 1;
                let bytes = serde_json::to_vec(&versioned)
                    .map_err(|e| ConflictableTransactionError::Abort(CatalogError::Serde(e)))?;
                tx.insert(shard.id.as_bytes(), bytes)?;
            }
            Ok(())
        });

        result.map_err(|e| match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => CatalogError::Store(e),
        })?;
        self.shards.flush()?;
        Ok(())
    }

    fn get_shard_raw(&self, shard_id: &str) -> Result<Option<Shard>, CatalogError> {
        match self.shards.get(shard_id.as_bytes())? {
            Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
            None => Ok(None),
        }
    }

    pub fn get_shard(&self, shard_id: &str) -> Result<Shard, CatalogError> {
        self.get_shard_raw(shard_id)?.ok_or(CatalogError::NotFound)
    }

    pub fn delete_shard(&self, shard_id: &str) -> Result<(), CatalogError> {
        let lock = Self::lock_for(&self.shard_locks, shard_id);
        let _guard = lock.lock();
        self.shards.remove(shard_id.as_bytes())?;
        self.shards.flush()?;
        Ok(())
    }

    pub fn list_shards(&self, client_app_id: Option<&str>) -> Result<Vec<Shard>, CatalogError> {
        let mut out = Vec::new();
        for item in self.shards.iter() {
            let (_k, v) = item?;
            let shard: Shard = serde_json::from_slice(&v)?;
            if let Some(app_id) = client_app_id {
                if shard.client_app_id.as_deref() != Some(app_id) {
                    continue;
                }
            }
            out.push(shard);
        }
        Ok(out)
    }

    /// Stream of every committed mutation to `shards/*`, in commit order.
    /// `created` vs `updated` is derived from the record's own version
    /// counter (version 1 is a creation, anything higher is an update) so
    /// no extra bookkeeping tree is needed.
    pub fn watch_shards(&self) -> impl Stream<Item = ShardWatchEvent> + Send {
        let subscriber = self.shards.watch_prefix(Vec::new());
        futures::stream::unfold(subscriber, |mut sub| async move {
            loop {
                let event = (&mut sub).await?;
                match event {
                    sled::Event::Insert { value, .. } => {
                        let shard: Shard = match serde_json::from_slice(&value) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "dropping unparseable shard watch event");
                                continue;
                            }
                        };
                        let kind = if shard.version <= 1 {
                            WatchEventKind::Created
                        } else {
                            WatchEventKind::Updated
                        };
                        return Some((
                            ShardWatchEvent {
                                kind,
                                shard: WatchedShard::Upserted(shard),
                            },
                            sub,
                        ));
                    }
                    sled::Event::Remove { key } => {
                        let id = String::from_utf8_lossy(&key).into_owned();
                        return Some((
                            ShardWatchEvent {
                                kind: WatchEventKind::Deleted,
                                shard: WatchedShard::Deleted(id),
                            },
                            sub,
                        ));
                    }
                }
            }
        })
    }

    // --- reshard jobs ---

    pub fn put_reshard_job(
        &self,
        mut job: ReshardJob,
        expected_version: Option<u64>,
    ) -> Result<ReshardJob, CatalogError> {
        let lock = Self::lock_for(&self.job_locks, &job.job_id);
        let _guard = lock.lock();

        let existing = self.get_reshard_job_raw(&job.job_id)?;
        if let (Some(current), Some(expected)) = (&existing, expected_version) {
            if current.version != expected {
                return Err(CatalogError::Conflict {
                    expected,
                    actual: current.version,
                });
            }
        }

        job.version = existing.as_ref().map(|j| j.version + 1).unwrap_or(1);
        let bytes = serde_json::to_vec(&job)?;
        self.jobs.insert(job.job_id.as_bytes(), bytes)?;
        self.jobs.flush()?;
        Ok(job)
    }

    fn get_reshard_job_raw(&self, job_id: &str) -> Result<Option<ReshardJob>, CatalogError> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
            None => Ok(None),
        }
    }

    pub fn get_reshard_job(&self, job_id: &str) -> Result<ReshardJob, CatalogError> {
        self.get_reshard_job_raw(job_id)?.ok_or(CatalogError::NotFound)
    }

    pub fn list_reshard_jobs(
        &self,
        shard_id: Option<&str>,
    ) -> Result<Vec<ReshardJob>, CatalogError> {
        let mut out = Vec::new();
        for item in self.jobs.iter() {
            let (_k, v) = item?;
            let job: ReshardJob = serde_json::from_slice(&v)?;
            if let Some(id) = shard_id {
                if !job.source_shards.iter().any(|s| s == id)
                    && !job.target_shards.iter().any(|s| s == id)
                {
                    continue;
                }
            }
            out.push(job);
        }
        Ok(out)
    }

    pub fn watch_jobs(&self) -> impl Stream<Item = JobWatchEvent> + Send {
        let subscriber = self.jobs.watch_prefix(Vec::new());
        futures::stream::unfold(subscriber, |mut sub| async move {
            loop {
                let event = (&mut sub).await?;
                match event {
                    sled::Event::Insert { value, .. } => {
                        let job: ReshardJob = match serde_json::from_slice(&value) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!(error = %e, "dropping unparseable job watch event");
                                continue;
                            }
                        };
                        let kind = if job.version <= 1 {
                            WatchEventKind::Created
                        } else {
                            WatchEventKind::Updated
                        };
                        return Some((
                            JobWatchEvent {
                                kind,
                                job: WatchedJob::Upserted(job),
                            },
                            sub,
                        ));
                    }
                    sled::Event::Remove { key } => {
                        let id = String::from_utf8_lossy(&key).into_owned();
                        return Some((
                            JobWatchEvent {
                                kind: WatchEventKind::Deleted,
                                job: WatchedJob::Deleted(id),
                            },
                            sub,
                        ));
                    }
                }
            }
        })
    }

    /// True if any non-terminal job already touches `shard_id` (§4.9: "only
    /// one active job may touch a given shard").
    pub fn has_active_job_for(&self, shard_id: &str) -> Result<bool, CatalogError> {
        Ok(self
            .list_reshard_jobs(Some(shard_id))?
            .iter()
            .any(|j| !j.phase.is_terminal()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShardStatus;
    use futures::StreamExt;

    fn sample_shard(id: &str) -> Shard {
        Shard {
            id: id.to_string(),
            name: id.to_string(),
            client_app_id: None,
            primary_endpoint: Some("db1:5432".into()),
            replicas: vec![],
            hash_range_start: 0,
            hash_range_end: 1000,
            status: ShardStatus::Active,
            vnode_count: 256,
            version: 0,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        let shard = sample_shard("s1");
        let written = store.put_shard(shard.clone(), None).unwrap();
        assert_eq!(written.version, 1);
        let read = store.get_shard("s1").unwrap();
        assert_eq!(read.id, "s1");
    }

    #[test]
    fn get_missing_shard_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        assert!(matches!(store.get_shard("missing"), Err(CatalogError::NotFound)));
    }

    #[test]
    fn cas_conflict_on_stale_expected_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        let shard = sample_shard("s1");
        store.put_shard(shard.clone(), None).unwrap();
        let result = store.put_shard(shard, Some(99));
        assert!(matches!(result, Err(CatalogError::Conflict { .. })));
    }

    #[test]
    fn active_shard_without_primary_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        let mut shard = sample_shard("s1");
        shard.primary_endpoint = None;
        let result = store.put_shard(shard, None);
        assert!(matches!(result, Err(CatalogError::InvalidRequest(_))));
    }

    #[test]
    fn delete_then_list_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        store.put_shard(sample_shard("s1"), None).unwrap();
        store.delete_shard("s1").unwrap();
        assert!(store.list_shards(None).unwrap().is_empty());
    }

    #[test]
    fn apply_cutover_commits_all_updates_together() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        store.put_shard(sample_shard("source"), None).unwrap();

        let mut target = sample_shard("target");
        target.status = ShardStatus::Provisioning;
        store.put_shard(target, None).unwrap();

        let mut source_inactive = store.get_shard("source").unwrap();
        source_inactive.status = ShardStatus::Inactive;
        let mut target_active = store.get_shard("target").unwrap();
        target_active.status = ShardStatus::Active;

        store
            .apply_cutover(vec![source_inactive, target_active])
            .unwrap();

        assert_eq!(store.get_shard("source").unwrap().status, ShardStatus::Inactive);
        assert_eq!(store.get_shard("target").unwrap().status, ShardStatus::Active);
    }

    #[tokio::test]
    async fn watch_observes_put_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        let mut events = Box::pin(store.watch_shards());

        store.put_shard(sample_shard("s1"), None).unwrap();
        let first = events.next().await.unwrap();
        assert_eq!(first.kind, WatchEventKind::Created);

        store.put_shard(sample_shard("s1"), Some(1)).unwrap();
        let second = events.next().await.unwrap();
        assert_eq!(second.kind, WatchEventKind::Updated);
    }
}
