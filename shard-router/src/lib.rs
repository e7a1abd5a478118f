//! Consistency-aware request router: resolves a shard key through the
//! registry, picks an endpoint, forwards the request, and maps every
//! failure mode into a single `RouterError` surface.

mod error;
mod router;

pub use error::RouterError;
pub use router::{Consistency, ExecuteRequest, ExecuteResponse, Router, RouterConfig};
