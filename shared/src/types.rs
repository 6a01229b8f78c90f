use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Power state of a backend as reported by its lifecycle provider.
/// Never cached by the dispatcher; every decision re-queries the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PowerState {
    /// Parse a provider-reported state name, ignoring case
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopped" => Some(Self::Stopped),
            "starting" | "pending" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one managed endpoint, served by the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    /// Unique endpoint name, e.g. "survival"
    pub name: String,

    /// Externally visible subdomain under the root domain
    pub sub_domain: String,

    /// Port the real backend listens on
    pub port: u16,

    /// Port of the decoy standing in for the backend
    pub decoy_port: u16,

    /// Last time the backend showed activity
    pub last_activity: DateTime<Utc>,

    /// Seconds since last activity
    pub idle_secs: u64,

    /// Current service record target, "host:port"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    /// Address published for the backend, present only while it runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Live provider state, only filled when explicitly queried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PowerState>,
}

/// Contents of both resolution record tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// service name -> "host:port"
    pub services: BTreeMap<String, String>,

    /// plain name -> IPv4 address
    pub addresses: BTreeMap<String, String>,
}
