//! Bus error types

use thiserror::Error;

/// Cloud sync error types
#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid broker address: {0}")]
    InvalidBroker(String),

    #[error("invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("MQTT client not connected")]
    NotConnected,

    #[error("invalid command payload: {0}")]
    InvalidCommand(String),
}
