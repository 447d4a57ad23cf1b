//! Bus configuration

use crate::error::BusError;
use rumqttc::{MqttOptions, QoS};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Default MQTT port when the broker address carries none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker address: `host`, `host:port`, `tcp://host:port` or `mqtt://host:port`
    pub broker: String,
    /// Username, applied only together with a password
    pub username: Option<String>,
    /// Password, applied only together with a username
    pub password: Option<String>,
    /// MQTT client identifier
    pub client_id: String,
    /// Base topic for telemetry
    pub data_topic: String,
    /// Base topic for commands and responses
    pub command_topic: String,
    /// Delivery guarantee for every publish and subscription
    pub qos: QoS,
    /// MQTT keep-alive
    pub keep_alive: Duration,
    /// Keep polling the connection after an error
    pub auto_reconnect: bool,
    /// Pause before the next connection attempt
    pub reconnect_delay: Duration,
    /// Target used when a command does not name one
    pub vehicle_id: String,
    /// Publish and subscribe on the base topics directly
    pub flat_topics: bool,
    /// How long an inbound command may wait for room in the link's queue
    pub command_forward_timeout: Duration,
    /// Capacity of the client's outgoing request queue
    pub request_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            username: None,
            password: None,
            client_id: generate_client_id(),
            data_topic: "car/telemetry".to_string(),
            command_topic: "car/command".to_string(),
            qos: QoS::AtLeastOnce,
            keep_alive: Duration::from_secs(60),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            vehicle_id: "default".to_string(),
            flat_topics: false,
            command_forward_timeout: Duration::from_secs(5),
            request_capacity: 64,
        }
    }
}

impl BusConfig {
    /// Split the broker address into host and port
    pub fn broker_endpoint(&self) -> Result<(String, u16), BusError> {
        parse_broker(&self.broker)
    }

    /// Credentials, only when both a username and a password are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Build client options, logging which authentication mode is used
    pub fn mqtt_options(&self) -> Result<MqttOptions, BusError> {
        let (host, port) = self.broker_endpoint()?;
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        match self.credentials() {
            Some((user, pass)) => {
                options.set_credentials(user, pass);
                info!("MQTT authentication: ENABLED (user {})", user);
            }
            None => info!("MQTT authentication: DISABLED (anonymous mode)"),
        }

        Ok(options)
    }
}

/// `obd-bridge-` followed by 8 random hex digits
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("obd-bridge-{}", &id[..8])
}

/// Map a numeric QoS level
pub fn qos_from_level(level: u8) -> Result<QoS, BusError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BusError::InvalidQos(other)),
    }
}

fn parse_broker(broker: &str) -> Result<(String, u16), BusError> {
    let invalid = || BusError::InvalidBroker(broker.to_string());

    let address = broker.trim();
    let address = ["tcp://", "mqtt://"]
        .iter()
        .find_map(|scheme| address.strip_prefix(scheme))
        .unwrap_or(address);
    if address.is_empty() || address.contains("://") || address.contains('/') {
        return Err(invalid());
    }

    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            if host.is_empty() || port == 0 {
                return Err(invalid());
            }
            Ok((host.to_string(), port))
        }
        None => Ok((address.to_string(), DEFAULT_MQTT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_forms() {
        assert_eq!(parse_broker("localhost").unwrap(), ("localhost".to_string(), 1883));
        assert_eq!(parse_broker("10.0.0.2:1884").unwrap(), ("10.0.0.2".to_string(), 1884));
        assert_eq!(
            parse_broker("tcp://broker.local:8883").unwrap(),
            ("broker.local".to_string(), 8883)
        );
        assert_eq!(parse_broker("mqtt://broker").unwrap(), ("broker".to_string(), 1883));
    }

    #[test]
    fn test_invalid_brokers() {
        for broker in ["", "tcp://", "ws://host:80", "host:abc", ":1883", "host:0", "host/path"] {
            assert!(parse_broker(broker).is_err(), "{:?} should be rejected", broker);
        }
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let mut config = BusConfig {
            username: Some("user".to_string()),
            ..BusConfig::default()
        };
        assert!(config.credentials().is_none());

        config.password = Some(String::new());
        assert!(config.credentials().is_none());

        config.password = Some("secret".to_string());
        assert_eq!(config.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_level(3), Err(BusError::InvalidQos(3))));
    }

    #[test]
    fn test_generated_client_id() {
        let id = generate_client_id();
        assert!(id.starts_with("obd-bridge-"));
        assert_eq!(id.len(), "obd-bridge-".len() + 8);
        assert_ne!(id, generate_client_id());
    }

    #[test]
    fn test_mqtt_options() {
        let config = BusConfig {
            broker: "tcp://broker:1884".to_string(),
            client_id: "test-client".to_string(),
            ..BusConfig::default()
        };
        let options = config.mqtt_options().unwrap();
        assert_eq!(options.broker_address(), ("broker".to_string(), 1884));
        assert_eq!(options.client_id(), "test-client");
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }
}
