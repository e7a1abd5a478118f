//! Online reshard coordinator (split and merge) driving catalog-recorded
//! jobs through snapshot, copy, tail, and atomic cutover phases.

mod coordinator;
mod driver;
mod error;

pub use coordinator::{NewShardSpec, ReshardConfig, ReshardCoordinator};
pub use driver::{DataMoverDriver, LogPosition};
pub use error::ReshardError;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use serde_json::Value;
    use shard_catalog::{CatalogStore, Shard, ShardStatus};
    use shard_pool::{BackendDriver, BackendError, BackendResponse};
    use shard_ring::HashRange;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// `writes` models each source's committed-write head; `snapshot` reads
    /// it without mutating, `tail_since` instantly replays up to the
    /// current head (no concurrent writes land mid-test, so one round
    /// always converges).
    #[derive(Debug, Default)]
    struct FakeMoverDriver {
        writes: DashMap<String, AtomicU64>,
    }

    impl FakeMoverDriver {
        fn head(&self, endpoint: &str) -> u64 {
            self.writes.entry(endpoint.to_string()).or_insert_with(|| AtomicU64::new(5));
            self.writes.get(endpoint).unwrap().load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendDriver for FakeMoverDriver {
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
    }

    #[async_trait]
    impl DataMoverDriver for FakeMoverDriver {
        async fn snapshot(&self, endpoint: &str) -> Result<LogPosition, BackendError> {
            Ok(self.head(endpoint))
        }

        async fn copy_range(&self, _source: &str, _target: &str, _range: HashRange) -> Result<(), BackendError> {
            Ok(())
        }

        async fn tail_since(
            &self,
            source: &str,
            _target: &str,
            _range: HashRange,
            _since: LogPosition,
        ) -> Result<LogPosition, BackendError> {
            Ok(self.head(source))
        }
    }

    fn source_shard() -> Shard {
        Shard {
            id: "s1".into(),
            name: "s1".into(),
            client_app_id: None,
            primary_endpoint: Some("p1".into()),
            replicas: vec![],
            hash_range_start: 0,
            hash_range_end: u64::MAX,
            status: ShardStatus::Active,
            vnode_count: 64,
            version: 0,
        }
    }

    async fn wait_for_terminal(catalog: &Arc<CatalogStore>, job_id: &str) -> shard_catalog::ReshardJob {
        for _ in 0..100 {
            let job = catalog.get_reshard_job(job_id).unwrap();
            if job.phase.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        catalog.get_reshard_job(job_id).unwrap()
    }

    #[tokio::test]
    async fn split_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::open(dir.path()).unwrap());
        catalog.put_shard(source_shard(), None).unwrap();

        let coordinator = Arc::new(ReshardCoordinator::new(
            catalog.clone(),
            Arc::new(FakeMoverDriver::default()),
            ReshardConfig::default(),
        ));

        let job_id = coordinator
            .start_split(
                "s1",
                vec![u64::MAX / 2],
                vec![
                    NewShardSpec {
                        id: "s1a".into(),
                        name: "s1a".into(),
                        primary_endpoint: "p1a".into(),
                        replicas: vec![],
                        vnode_count: 32,
                    },
                    NewShardSpec {
                        id: "s1b".into(),
                        name: "s1b".into(),
                        primary_endpoint: "p1b".into(),
                        replicas: vec![],
                        vnode_count: 32,
                    },
                ],
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&catalog, &job_id).await;
        assert_eq!(job.phase, shard_catalog::ReshardPhase::Completed);

        assert_eq!(catalog.get_shard("s1").unwrap().status, ShardStatus::Inactive);
        assert_eq!(catalog.get_shard("s1a").unwrap().status, ShardStatus::Active);
        assert_eq!(catalog.get_shard("s1b").unwrap().status, ShardStatus::Active);
    }

    #[tokio::test]
    async fn second_job_on_same_shard_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::open(dir.path()).unwrap());
        catalog.put_shard(source_shard(), None).unwrap();

        let coordinator = Arc::new(ReshardCoordinator::new(
            catalog.clone(),
            Arc::new(FakeMoverDriver::default()),
            ReshardConfig::default(),
        ));

        let targets = || {
            vec![
                NewShardSpec {
                    id: "a".into(),
                    name: "a".into(),
                    primary_endpoint: "pa".into(),
                    replicas: vec![],
                    vnode_count: 16,
                },
                NewShardSpec {
                    id: "b".into(),
                    name: "b".into(),
                    primary_endpoint: "pb".into(),
                    replicas: vec![],
                    vnode_count: 16,
                },
            ]
        };

        coordinator.start_split("s1", vec![u64::MAX / 2], targets()).await.unwrap();
        let second = coordinator.start_split("s1", vec![u64::MAX / 2], targets()).await;
        assert!(matches!(second, Err(ReshardError::Busy(_))));
    }
}
