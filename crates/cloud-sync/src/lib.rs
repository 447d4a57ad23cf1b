//! Cloud Synchronization Module
//!
//! MQTT bus client for the OBD bridge:
//! - Telemetry publishing, one topic per metric
//! - Command subscription, re-established on every connect
//! - Command response publishing
//! - Conditional authentication

mod client;
mod config;
mod error;
mod message;
mod topics;

pub use client::{BusChannels, BusClient, BusEvent, BusTransport, Dispatcher};
pub use config::{generate_client_id, qos_from_level, BusConfig, DEFAULT_MQTT_PORT};
pub use error::BusError;
pub use message::{CommandMessage, CommandResponse, ForwardedCommand, ResponseEnvelope, ResponseStatus};
pub use rumqttc::QoS;
pub use topics::Topics;
