//! Per-shard connection pooling: primary + ordered replica pools, liveness
//! probing, and the `BackendDriver` boundary to the actual backend
//! protocol (out of scope for this core).

mod driver;
mod error;
mod pool;

pub use driver::{BackendDriver, BackendError, BackendResponse};
pub use error::PoolError;
pub use pool::{ConnectionPool, PoolConfig, PoolPermit};
