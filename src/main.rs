// Minimal daemon entrypoint for the shard router core: loads config,
// constructs `Core`, starts it, waits for a shutdown signal, stops it.
// No HTTP/CLI surface — that belongs to an external collaborator.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::signal;
use tracing::{error, info};

use shard_core::{Core, CoreConfig};
use shard_hash::Murmur3Hash;
use shard_pool::{BackendDriver, BackendError, BackendResponse};
use shard_reshard::{DataMoverDriver, LogPosition};
use shard_ring::HashRange;

/// Placeholder `BackendDriver`/`DataMoverDriver` used until a deployment
/// wires in a real one for its database protocol. `ping` always succeeds
/// (so the pool and health controller start in a healthy state); every
/// data-moving call returns an error so a misconfigured deployment fails
/// loudly instead of silently dropping writes.
#[derive(Debug, Default)]
struct UnconfiguredDriver;

#[async_trait]
impl BackendDriver for UnconfiguredDriver {
    async fn ping(&self, _endpoint: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn execute(
        &self,
        endpoint: &str,
        _query: &str,
        _params: &[Value],
    ) -> Result<BackendResponse, BackendError> {
        Err(BackendError(format!(
            "no backend driver configured for endpoint {endpoint}"
        )))
    }
}

#[async_trait]
impl DataMoverDriver for UnconfiguredDriver {
    async fn snapshot(&self, endpoint: &str) -> Result<LogPosition, BackendError> {
        Err(BackendError(format!("no backend driver configured for {endpoint}")))
    }

    async fn copy_range(&self, source: &str, _target: &str, _range: HashRange) -> Result<(), BackendError> {
        Err(BackendError(format!("no backend driver configured for {source}")))
    }

    async fn tail_since(
        &self,
        source: &str,
        _target: &str,
        _range: HashRange,
        _since: LogPosition,
    ) -> Result<LogPosition, BackendError> {
        Err(BackendError(format!("no backend driver configured for {source}")))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("shard_core=info".parse()?),
        )
        .json()
        .init();

    info!("starting shard router core");

    let config = CoreConfig::load().await?;
    let core = match Core::new(config, Arc::new(UnconfiguredDriver), Arc::new(Murmur3Hash)) {
        Ok(core) => core,
        Err(e) => {
            error!("failed to wire core components: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = core.start().await {
        error!("failed to start core: {}", e);
        return Err(e);
    }
    info!("shard router core started");

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping"),
        Err(err) => error!("unable to listen for shutdown signal: {}", err),
    }

    if let Err(e) = core.stop().await {
        error!("error during shutdown: {}", e);
        return Err(e);
    }
    info!("shard router core stopped");
    Ok(())
}
