//! Data-mover driver boundary (§4.9.1): snapshot/copy/tail operations the
//! spec leaves to "the shard's native mechanism". Extends `BackendDriver`
//! so a single driver implementation backs both query execution and
//! reshard data movement.

use async_trait::async_trait;
use shard_pool::{BackendDriver, BackendError};
use shard_ring::HashRange;

/// A monotonic position in a source's write log, returned by `snapshot`
/// and advanced by `tail_since`. Opaque to the coordinator beyond
/// ordering comparisons.
pub type LogPosition = u64;

#[async_trait]
pub trait DataMoverDriver: BackendDriver {
    /// Takes a consistent snapshot of `endpoint` and returns the log
    /// position it was taken at.
    async fn snapshot(&self, endpoint: &str) -> Result<LogPosition, BackendError>;

    /// Bulk-copies rows in `range` from `source` to `target`, filtered by
    /// `H(shard_key) mod ring` against `range`.
    async fn copy_range(
        &self,
        source: &str,
        target: &str,
        range: HashRange,
    ) -> Result<(), BackendError>;

    /// Replays writes committed on `source` after `since`, restricted to
    /// `range`, onto `target`. Returns the new replayed position; the
    /// coordinator calls this repeatedly until it catches up to a fresh
    /// `snapshot` position.
    async fn tail_since(
        &self,
        source: &str,
        target: &str,
        range: HashRange,
        since: LogPosition,
    ) -> Result<LogPosition, BackendError>;
}
