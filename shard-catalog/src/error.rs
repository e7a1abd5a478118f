use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found")]
    NotFound,

    #[error("cas conflict: expected version {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("catalog store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a reshard job is already active for shard {0}")]
    Busy(String),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
