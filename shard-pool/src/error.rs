use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("endpoint {0} is down")]
    Down(String),

    #[error("unknown shard {0}")]
    UnknownShard(String),

    #[error("backend error: {0}")]
    Backend(String),
}
