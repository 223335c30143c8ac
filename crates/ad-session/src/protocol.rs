use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("message has no string \"action\" field")]
    MissingAction,

    #[error("invalid payload for action {action:?}: {source}")]
    InvalidPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// ---------------------------------------------------------------------------
// Agent -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentMessage {
    LoginComplete,
    LoginFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DeliveryProgress {
        #[serde(default)]
        progress: Value,
    },
    DeliveryComplete {
        #[serde(default)]
        summary: Value,
    },
    /// An action this server does not know. Logged and ignored.
    #[serde(skip)]
    Unknown { action: String },
}

const KNOWN_ACTIONS: &[&str] = &[
    "login_complete",
    "login_failed",
    "delivery_progress",
    "delivery_complete",
];

impl AgentMessage {
    /// Decode one text frame. Unknown actions decode to [`AgentMessage::Unknown`].
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingAction)?
            .to_string();

        if !KNOWN_ACTIONS.contains(&action.as_str()) {
            return Ok(AgentMessage::Unknown { action });
        }
        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { action, source })
    }

    pub fn action(&self) -> &str {
        match self {
            AgentMessage::LoginComplete => "login_complete",
            AgentMessage::LoginFailed { .. } => "login_failed",
            AgentMessage::DeliveryProgress { .. } => "delivery_progress",
            AgentMessage::DeliveryComplete { .. } => "delivery_complete",
            AgentMessage::Unknown { action } => action,
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerCommand {
    /// Ask the agent to log in; `timeout` is in seconds.
    Login { timeout: u64 },
    StartDelivery { config: Value },
    DeliveryAck,
    StopDelivery,
}

impl ServerCommand {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn action(&self) -> &'static str {
        match self {
            ServerCommand::Login { .. } => "login",
            ServerCommand::StartDelivery { .. } => "start_delivery",
            ServerCommand::DeliveryAck => "delivery_ack",
            ServerCommand::StopDelivery => "stop_delivery",
        }
    }
}
