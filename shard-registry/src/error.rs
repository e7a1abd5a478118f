use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("shard not found")]
    NotFound,

    #[error("key resolved to no shard")]
    NoShard,

    #[error("shard {0} is not routable")]
    NotRoutable(String),
}
