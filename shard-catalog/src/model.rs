//! Catalog record types: `Shard` and `ReshardJob`, and their wire/persisted
//! JSON shapes (§6's Shard JSON fields, §3's data model).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shard_ring::HashRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Provisioning,
    Active,
    Draining,
    Inactive,
    MigratingOut,
    MigratingIn,
}

/// A back-end database partition owning a contiguous (possibly wrapping)
/// hash range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub name: String,
    pub client_app_id: Option<String>,
    pub primary_endpoint: Option<String>,
    pub replicas: Vec<String>,
    pub hash_range_start: u64,
    pub hash_range_end: u64,
    pub status: ShardStatus,
    pub vnode_count: u32,
    pub version: u64,
}

impl Shard {
    pub fn range(&self) -> HashRange {
        HashRange::new(self.hash_range_start, self.hash_range_end)
    }

    /// A shard with no primary endpoint is never routable, regardless of
    /// status.
    pub fn is_routable(&self) -> bool {
        self.primary_endpoint.is_some() && self.status == ShardStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReshardKind {
    Split,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReshardPhase {
    Pending,
    Snapshotting,
    Copying,
    Tailing,
    Cutover,
    Finalizing,
    Completed,
    Failed,
    RolledBack,
}

impl ReshardPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Cutover is the sole commit point: once reached, a failure must
    /// proceed forward rather than unwind.
    pub fn past_commit_point(self) -> bool {
        matches!(
            self,
            Self::Cutover | Self::Finalizing | Self::Completed | Self::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshardJob {
    pub job_id: String,
    pub kind: ReshardKind,
    pub source_shards: Vec<String>,
    pub target_shards: Vec<String>,
    pub phase: ReshardPhase,
    pub progress: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub version: u64,
}
