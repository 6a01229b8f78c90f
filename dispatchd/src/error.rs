use std::net::SocketAddr;
use std::time::Duration;
use crate::game::codec::CodecError;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failures surfaced by the controller, the authority and the decoys.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("endpoint not found: {0}")]
    NotFound(String),

    #[error("endpoint already registered: {0}")]
    AlreadyRegistered(String),

    /// A lifecycle call against the control plane failed
    #[error("provider error for {endpoint}: {message}")]
    Provider { endpoint: String, message: String },

    #[error("endpoint {endpoint} did not reach running within {waited:?}")]
    StartTimeout { endpoint: String, waited: Duration },

    #[error("no free decoy port in {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint was unregistered while the operation was in flight
    #[error("endpoint {0} was unregistered")]
    Cancelled(String),
}

impl DispatchError {
    pub fn provider(endpoint: &str, err: anyhow::Error) -> Self {
        Self::Provider {
            endpoint: endpoint.to_string(),
            message: format!("{:#}", err),
        }
    }
}
