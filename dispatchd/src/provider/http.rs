use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use shared::types::PowerState;
use crate::provider::{LifecycleProvider, ProviderStatus};

/// Talks to a REST control plane:
/// `POST {base}/start`, `POST {base}/stop`, `GET {base}/status`.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    state: String,
    #[serde(default)]
    ip: Option<String>,
}

impl HttpProvider {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, action: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, action);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post(&self, action: &str) -> Result<()> {
        self.request(reqwest::Method::POST, action)
            .send()
            .await
            .with_context(|| format!("{} request to {} failed", action, self.base_url))?
            .error_for_status()
            .with_context(|| format!("{} rejected by {}", action, self.base_url))?;
        Ok(())
    }
}

#[async_trait]
impl LifecycleProvider for HttpProvider {
    async fn start(&self) -> Result<()> {
        self.post("start").await
    }

    async fn stop(&self) -> Result<()> {
        self.post("stop").await
    }

    async fn status(&self) -> Result<ProviderStatus> {
        let body: StatusBody = self
            .request(reqwest::Method::GET, "status")
            .send()
            .await
            .with_context(|| format!("status request to {} failed", self.base_url))?
            .error_for_status()
            .with_context(|| format!("status rejected by {}", self.base_url))?
            .json()
            .await
            .context("Failed to decode status body")?;

        status_from_body(body)
    }
}

fn status_from_body(body: StatusBody) -> Result<ProviderStatus> {
    let state = PowerState::parse(&body.state)
        .ok_or_else(|| anyhow!("unknown power state `{}`", body.state))?;

    // addresses reported for a non-running backend are stale
    let ip = match (state, body.ip.as_deref()) {
        (PowerState::Running, Some(ip)) if !ip.is_empty() => Some(
            ip.parse::<Ipv4Addr>()
                .with_context(|| format!("invalid address `{}` in status body", ip))?,
        ),
        _ => None,
    };

    Ok(ProviderStatus { state, ip })
}
