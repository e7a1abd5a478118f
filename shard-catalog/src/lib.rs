//! Durable, watched key-value catalog of shards and reshard jobs.
//!
//! This is the authoritative store the registry, router, health controller,
//! failover coordinator, and reshard coordinator all observe.

mod error;
mod model;
mod store;

pub use error::CatalogError;
pub use model::{ReshardJob, ReshardKind, ReshardPhase, Shard, ShardStatus};
pub use store::{
    CatalogStore, JobWatchEvent, ShardWatchEvent, WatchEventKind, WatchedJob, WatchedShard,
};
