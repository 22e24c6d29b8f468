use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppDescriptor {
    pub name: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "launch")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    Register {
        identity: String,
        hostname: String,
    },
    Heartbeat,
    AppsList {
        identity: String,
        #[serde(default)]
        apps: Vec<AppDescriptor>,
    },
    Command {
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    LaunchApp {
        app_name: String,
        app_path: String,
    },
    RefreshApps,
    #[serde(rename_all = "camelCase")]
    CloseApp {
        app_name: String,
        app_path: String,
    },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Register { .. } => "REGISTER",
            WireMessage::Heartbeat => "HEARTBEAT",
            WireMessage::AppsList { .. } => "APPS_LIST",
            WireMessage::Command { .. } => "COMMAND",
            WireMessage::LaunchApp { .. } => "LAUNCH_APP",
            WireMessage::RefreshApps => "REFRESH_APPS",
            WireMessage::CloseApp { .. } => "CLOSE_APP",
        }
    }

    pub fn is_agent_to_coordinator(&self) -> bool {
        matches!(
            self,
            WireMessage::Register { .. } | WireMessage::Heartbeat | WireMessage::AppsList { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    OversizedMessage { size: usize, max: usize },
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
}

pub fn encode_message(
    message: &WireMessage,
    max_message_bytes: usize,
) -> Result<String, ProtocolError> {
    let encoded =
        serde_json::to_string(message).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > max_message_bytes {
        return Err(ProtocolError::OversizedMessage {
            size: encoded.len(),
            max: max_message_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_message(raw: &str, max_message_bytes: usize) -> Result<WireMessage, ProtocolError> {
    if raw.len() > max_message_bytes {
        return Err(ProtocolError::OversizedMessage {
            size: raw.len(),
            max: max_message_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| ProtocolError::Decode(err.to_string()))
}
