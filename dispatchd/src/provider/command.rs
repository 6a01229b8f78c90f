use std::net::Ipv4Addr;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use shared::types::PowerState;
use crate::provider::{LifecycleProvider, ProviderStatus};

/// Drives a backend through shell hooks.
///
/// `start` and `stop` succeed when their command exits 0. `status` must
/// print "<state> [ipv4]", e.g. "running 10.0.0.5" or "stopped".
#[derive(Debug, Clone)]
pub struct CommandProvider {
    start: String,
    stop: String,
    status: String,
}

impl CommandProvider {
    pub fn new(start: &str, stop: &str, status: &str) -> Self {
        Self {
            start: start.to_string(),
            stop: stop.to_string(),
            status: status.to_string(),
        }
    }

    async fn run(command: &str) -> Result<String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn `{}`", command))?;

        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl LifecycleProvider for CommandProvider {
    async fn start(&self) -> Result<()> {
        Self::run(&self.start).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        Self::run(&self.stop).await.map(|_| ())
    }

    async fn status(&self) -> Result<ProviderStatus> {
        let output = Self::run(&self.status).await?;
        parse_status_line(&output)
    }
}

/// Parse "<state> [ipv4]" from the first non-empty line
pub fn parse_status_line(output: &str) -> Result<ProviderStatus> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("status command printed nothing"))?;

    let mut parts = line.split_whitespace();
    let state_word = parts.next().unwrap_or_default();
    let state = PowerState::parse(state_word)
        .ok_or_else(|| anyhow!("unknown power state `{}`", state_word))?;

    // addresses reported for a non-running backend are stale
    let ip = match parts.next().filter(|_| state == PowerState::Running) {
        Some(ip) => Some(
            ip.parse::<Ipv4Addr>()
                .with_context(|| format!("invalid address `{}` in status output", ip))?,
        ),
        None => None,
    };

    Ok(ProviderStatus { state, ip })
}
