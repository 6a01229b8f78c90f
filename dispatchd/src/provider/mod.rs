pub mod command;
pub mod http;
#[cfg(test)]
pub mod testing;

use std::net::Ipv4Addr;
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use shared::types::PowerState;
use crate::config::ProviderConfig;

/// What a provider reports about its backend. `ip` is only meaningful
/// while the backend is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStatus {
    pub state: PowerState,
    pub ip: Option<Ipv4Addr>,
}

/// Powers a backend on and off and reports its state.
///
/// Calls may take seconds. `start` only requests power-on; completion is
/// observed by polling `status`. `stop` must succeed on a stopped backend.
#[async_trait]
pub trait LifecycleProvider: Send + Sync + std::fmt::Debug {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn status(&self) -> Result<ProviderStatus>;
}

/// Build the provider described by a server's config block
pub fn build(config: &ProviderConfig) -> Result<Arc<dyn LifecycleProvider>> {
    let provider: Arc<dyn LifecycleProvider> = match config {
        ProviderConfig::Command { start, stop, status } => {
            Arc::new(command::CommandProvider::new(start, stop, status))
        }
        ProviderConfig::Http { base_url, token, timeout_secs } => Arc::new(http::HttpProvider::new(
            base_url,
            token.clone(),
            std::time::Duration::from_secs(*timeout_secs),
        )?),
    };
    Ok(provider)
}
