use shard_pool::PoolError;
use shard_registry::RegistryError;
use thiserror::Error;

/// Router-facing error taxonomy (§7). Every other component's error
/// converts into this one at the router boundary.
#[derive(Debug, Error, Clone)]
pub enum RouterError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no shard owns this key")]
    NoShard,

    #[error("primary required but unavailable")]
    NoPrimary,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend error: {message}")]
    BackendError {
        code: Option<String>,
        message: String,
    },
}

impl From<RegistryError> for RouterError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound | RegistryError::NoShard | RegistryError::NotRoutable(_) => {
                RouterError::NoShard
            }
        }
    }
}

impl From<PoolError> for RouterError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::PoolExhausted => RouterError::PoolExhausted,
            PoolError::Down(_) => RouterError::NoPrimary,
            PoolError::UnknownShard(_) => RouterError::NoShard,
            PoolError::Backend(message) => RouterError::BackendError { code: None, message },
        }
    }
}
