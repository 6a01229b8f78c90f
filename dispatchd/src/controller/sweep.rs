use std::net::SocketAddr;
use std::sync::Arc;
use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use shared::types::PowerState;
use crate::controller::{DispatchController, Endpoint};
use crate::game::probe;

impl DispatchController {
    /// Periodic idle sweep until the controller shuts down
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_sweep().await,
                _ = self.quit.cancelled() => {
                    tracing::info!("Idle sweep shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over every endpoint: stop backends idle past the threshold,
    /// probe the rest and refresh their activity when they look in use.
    pub async fn run_sweep(&self) {
        let endpoints = self.endpoints();
        tracing::debug!("Sweeping {} endpoints", endpoints.len());
        join_all(endpoints.iter().map(|endpoint| self.sweep_endpoint(endpoint))).await;
    }

    async fn sweep_endpoint(&self, endpoint: &Arc<Endpoint>) {
        if endpoint.is_cancelled() {
            return;
        }

        let status = match self.status(endpoint).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Sweep could not query {}: {}", endpoint.name, e);
                return;
            }
        };
        if status.state != PowerState::Running {
            return;
        }

        if endpoint.idle_for() >= self.options.idle_timeout {
            // a login may start the backend while we wait for the lock, so idleness is rechecked there
            if let Err(e) = self.stop_if_idle(endpoint, self.options.idle_timeout).await {
                tracing::warn!("Failed to stop idle server {}: {}", endpoint.name, e);
            }
            return;
        }

        let Some(ip) = status.ip else {
            return;
        };
        let addr = SocketAddr::new(ip.into(), endpoint.port);
        match probe::ping(addr, self.options.probe_timeout).await {
            Ok(report) if report.online > 0 || !self.options.require_players => {
                tracing::debug!("Server {} active with {} online", endpoint.name, report.online);
                endpoint.touch();
            }
            Ok(_) => {
                tracing::debug!("Server {} up with nobody online", endpoint.name);
            }
            Err(e) => {
                tracing::warn!("Probe of {} at {} failed: {}", endpoint.name, addr, e);
            }
        }
    }
}
