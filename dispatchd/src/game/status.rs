use serde::{Deserialize, Serialize};

/// Server list status document, as sent in the status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: StatusVersion,
    #[serde(default)]
    pub players: StatusPlayers,
    /// Either a plain string or a chat component, depending on the server
    #[serde(default)]
    pub description: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusPlayers {
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub online: i64,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

/// Plain text chat component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub text: String,
}

impl StatusResponse {
    /// Synthetic status for a sleeping backend: echoes the client's protocol
    /// version, reports nobody online and carries no icon.
    pub fn sleeping(name: &str, motd: &str, protocol: i32) -> Self {
        Self {
            version: StatusVersion {
                name: name.to_string(),
                protocol,
            },
            players: StatusPlayers::default(),
            description: serde_json::json!({ "text": motd }),
            favicon: None,
        }
    }
}

/// JSON body of a login disconnect
pub fn disconnect_reason(message: &str) -> String {
    serde_json::to_string(&ChatText {
        text: message.to_string(),
    })
    .unwrap_or_else(|_| String::from("{\"text\":\"\"}"))
}
