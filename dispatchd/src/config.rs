use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::DEFAULT_DISPATCH_LABEL;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub dns: DnsConfig,
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    pub root_domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Address the dispatcher label resolves to
    pub public_ip: Ipv4Addr,
    #[serde(default = "default_host_label")]
    pub host_label: String,
    /// Interface decoys bind on
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port_start")]
    pub port_start: u16,
    #[serde(default = "default_port_end")]
    pub port_end: u16,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_login_cooldown")]
    pub login_cooldown_secs: u64,
    /// Only count a reachable backend as active when players are online
    #[serde(default = "default_require_players")]
    pub require_players: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default = "default_kick")]
    pub kick: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,
}

/// One managed backend
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub sub_domain: String,
    pub port: u16,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Shell hooks; `status` prints "<state> [ipv4]"
    Command {
        start: String,
        stop: String,
        status: String,
    },
    /// Generic REST control plane
    Http {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

fn default_dns_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_ttl() -> u32 {
    60
}

fn default_host_label() -> String {
    DEFAULT_DISPATCH_LABEL.to_string()
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port_start() -> u16 {
    30000
}

fn default_port_end() -> u16 {
    30100
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_start_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_login_cooldown() -> u64 {
    10
}

fn default_require_players() -> bool {
    true
}

fn default_motd() -> String {
    "Server is sleeping. Join to wake it up!".to_string()
}

fn default_kick() -> String {
    "Server is starting, please reconnect in a minute.".to_string()
}

fn default_api_listen() -> String {
    "127.0.0.1:8054".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            motd: default_motd(),
            kick: default_kick(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
        }
    }
}

impl DispatchConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn login_cooldown(&self) -> Duration {
        Duration::from_secs(self.login_cooldown_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dns.root_domain.trim_matches('.').is_empty() {
            bail!("dns.root_domain must not be empty");
        }

        let dispatch = &self.dispatch;
        if dispatch.port_start > dispatch.port_end {
            bail!(
                "dispatch.port_start ({}) is above dispatch.port_end ({})",
                dispatch.port_start,
                dispatch.port_end
            );
        }
        // login_cooldown_secs may be zero, which turns the debounce off
        let timings = [
            ("sweep_interval_secs", dispatch.sweep_interval_secs),
            ("poll_interval_secs", dispatch.poll_interval_secs),
            ("idle_timeout_secs", dispatch.idle_timeout_secs),
            ("start_timeout_secs", dispatch.start_timeout_secs),
            ("probe_timeout_secs", dispatch.probe_timeout_secs),
        ];
        for (field, secs) in timings {
            if secs == 0 {
                bail!("dispatch.{} must be at least one second", field);
            }
        }

        let mut names = HashSet::new();
        let mut sub_domains = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                bail!("duplicate server name: {}", server.name);
            }
            if !sub_domains.insert(server.sub_domain.to_ascii_lowercase()) {
                bail!("duplicate server sub_domain: {}", server.sub_domain);
            }
            if server.sub_domain.eq_ignore_ascii_case(&dispatch.host_label) {
                bail!(
                    "server {} uses the dispatcher label {} as its sub_domain",
                    server.name,
                    dispatch.host_label
                );
            }
        }

        Ok(())
    }
}
