//! Bus message payloads

use crate::error::BusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound command published by an external client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// AT or PID command text, without the trailing carriage return
    pub command: String,
    /// Token echoed back in the response
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Vehicle the command is addressed to
    #[serde(default, alias = "vin")]
    pub target: String,
}

impl CommandMessage {
    /// Decode a command payload.
    ///
    /// JSON objects are read as [`CommandMessage`]. Anything else is taken as a
    /// base64-encoded raw command, which carries no correlation id.
    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| BusError::InvalidCommand("payload is not UTF-8".to_string()))?
            .trim();

        let message = if text.starts_with('{') {
            serde_json::from_str::<CommandMessage>(text)
                .map_err(|e| BusError::InvalidCommand(e.to_string()))?
        } else {
            let bytes = obd_protocol::decode_frame(text)
                .map_err(|e| BusError::InvalidCommand(e.to_string()))?;
            let command = String::from_utf8(bytes)
                .map_err(|_| BusError::InvalidCommand("decoded command is not UTF-8".to_string()))?;
            CommandMessage {
                command,
                correlation_id: String::new(),
                description: None,
                target: String::new(),
            }
        };

        message.validated()
    }

    fn validated(mut self) -> Result<Self, BusError> {
        let command = self.command.trim();
        if command.is_empty() {
            return Err(BusError::InvalidCommand("empty command".to_string()));
        }
        self.command = command.to_string();
        Ok(self)
    }
}

/// Outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

/// Response published for a correlated command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub correlation_id: String,
    pub status: ResponseStatus,
    /// Decoded telemetry, response text, or null
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResponse {
    pub fn success(correlation_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Success,
            result,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Error,
            result: serde_json::Value::Null,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Timeout,
            result: serde_json::Value::Null,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// A response paired with the target whose topic it goes to
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub target: String,
    pub response: CommandResponse,
}

/// A bus command that reached the link's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedCommand {
    /// Ticket the command was queued with
    pub ticket: u64,
    pub command: String,
    /// Empty for raw commands; the response still goes to the target
    pub correlation_id: String,
    pub target: String,
}
