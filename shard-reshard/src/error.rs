use thiserror::Error;

use shard_catalog::CatalogError;

#[derive(Debug, Error)]
pub enum ReshardError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a reshard job is already active for shard {0}")]
    Busy(String),

    #[error("job not found: {0}")]
    NotFound,

    #[error("phase retries exhausted in phase {phase:?}: {message}")]
    RetriesExhausted { phase: shard_catalog::ReshardPhase, message: String },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}
