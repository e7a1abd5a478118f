//! The `BackendDriver` boundary: the only point where the core touches a
//! concrete database protocol. Kept abstract because the protocol itself is
//! out of scope; a real implementation is an external collaborator. Tests
//! and the reshard coordinator's internal wiring use an in-memory fake.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub rows: Vec<Value>,
    pub row_count: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("backend error: {0}")]
pub struct BackendError(pub String);

/// Connect/ping/execute against one endpoint of one shard. `get_lag`
/// returns replication lag in milliseconds; `0` means "unknown", per the
/// spec's convention that unknown lag never alone implies `degraded`.
#[async_trait]
pub trait BackendDriver: Send + Sync + std::fmt::Debug {
    async fn ping(&self, endpoint: &str) -> Result<(), BackendError>;

    async fn execute(
        &self,
        endpoint: &str,
        query: &str,
        params: &[Value],
    ) -> Result<BackendResponse, BackendError>;

    async fn get_lag(&self, endpoint: &str) -> u64 {
        let _ = endpoint;
        0
    }

    /// Issues the provider-specific command promoting `endpoint` from
    /// replica to primary. The default succeeds trivially; real drivers
    /// override it with an actual promotion call.
    async fn promote(&self, endpoint: &str) -> Result<(), BackendError> {
        let _ = endpoint;
        Ok(())
    }
}
