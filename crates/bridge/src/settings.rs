//! Bridge configuration
//!
//! An optional file (YAML, TOML or JSON) is layered under environment
//! variables such as `OBD_BRIDGE__MQTT__BROKER`. Everything is validated
//! before any component starts.

use cloud_sync::{generate_client_id, qos_from_level, BusConfig};
use config::{Config, Environment, File};
use obd_protocol::{LinkConfig, DEFAULT_DEVICE_PATH};
use obd_scheduler::SchedulerConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "OBD_BRIDGE";

/// Configuration errors, all fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory setting: {0}")]
    MissingField(&'static str),

    #[error("mqtt.username and mqtt.password must be set together")]
    InconsistentCredentials,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Accepts either a list or a comma separated string, so lists can be set
/// from a single environment variable.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    let items = match ListOrCsv::deserialize(deserializer)? {
        ListOrCsv::List(items) => items,
        ListOrCsv::Csv(csv) => csv.split(',').map(str::to_string).collect(),
    };
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub device_path: String,
    pub baud_rate: u32,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub init_delay_ms: u64,
    pub init_settle_ms: u64,
    #[serde(deserialize_with = "string_list")]
    pub init_commands: Vec<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let link = LinkConfig::default();
        Self {
            device_path: link.device_path,
            baud_rate: link.baud_rate,
            reconnect_interval_ms: link.reconnect_interval.as_millis() as u64,
            connect_timeout_ms: link.connect_timeout.as_millis() as u64,
            read_timeout_ms: link.read_timeout.as_millis() as u64,
            write_timeout_ms: link.write_timeout.as_millis() as u64,
            init_delay_ms: link.init_delay.as_millis() as u64,
            init_settle_ms: link.init_settle.as_millis() as u64,
            init_commands: link.init_commands,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// `host`, `host:port`, `tcp://host:port` or `mqtt://host:port`
    pub broker: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub data_topic: String,
    pub command_topic: String,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    /// Response target when a command names none
    pub vehicle_id: String,
    pub flat_topics: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: String::new(),
            username: None,
            password: None,
            client_id: String::new(),
            data_topic: String::new(),
            command_topic: String::new(),
            qos: 1,
            keep_alive_secs: 60,
            auto_reconnect: true,
            reconnect_delay_ms: 5000,
            vehicle_id: "default".to_string(),
            flat_topics: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub command_gap_ms: u64,
    /// Two-hex-digit PID codes polled on every round
    #[serde(deserialize_with = "string_list")]
    pub pids: Vec<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            enabled: true,
            interval_ms: scheduler.interval.as_millis() as u64,
            command_gap_ms: scheduler.command_gap.as_millis() as u64,
            pids: scheduler.pids.iter().map(|pid| pid.code()).collect(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingSettings {
    pub fn max_level(&self) -> Result<Level, ConfigError> {
        self.level
            .parse::<Level>()
            .map_err(|e| invalid("logging.level", e.to_string()))
    }
}

/// Channel capacities and command timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub frame_channel: usize,
    pub telemetry_channel: usize,
    pub command_channel: usize,
    pub response_channel: usize,
    pub command_forward_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_channel: 100,
            telemetry_channel: 100,
            command_channel: 100,
            response_channel: 100,
            command_forward_timeout_ms: 5000,
            response_timeout_ms: 5000,
        }
    }
}

impl PipelineSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub link: LinkSettings,
    pub mqtt: MqttSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingSettings,
    pub bridge: PipelineSettings,
}

impl BridgeConfig {
    /// Load from `path` (when given) and the environment, then validate.
    ///
    /// A missing file is an error only when `required` is set.
    pub fn load(path: Option<&Path>, required: bool) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(required));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: BridgeConfig = settings.try_deserialize()?;
        config.validated()
    }

    /// Apply fallbacks and check every setting
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        let link = &mut self.link;
        if link.device_path.trim().is_empty() {
            link.device_path = DEFAULT_DEVICE_PATH.to_string();
        }
        if link.baud_rate == 0 {
            return Err(invalid("link.baud_rate", "must be positive"));
        }
        if link.reconnect_interval_ms == 0 {
            return Err(invalid("link.reconnect_interval_ms", "must be positive"));
        }
        if link.read_timeout_ms == 0 {
            return Err(invalid("link.read_timeout_ms", "must be positive"));
        }
        if link.write_timeout_ms == 0 {
            return Err(invalid("link.write_timeout_ms", "must be positive"));
        }

        let mqtt = &mut self.mqtt;
        if mqtt.broker.trim().is_empty() {
            return Err(ConfigError::MissingField("mqtt.broker"));
        }
        if mqtt.data_topic.trim().is_empty() {
            return Err(ConfigError::MissingField("mqtt.data_topic"));
        }
        if mqtt.command_topic.trim().is_empty() {
            return Err(ConfigError::MissingField("mqtt.command_topic"));
        }
        let has_user = mqtt.username.as_deref().is_some_and(|u| !u.is_empty());
        let has_pass = mqtt.password.as_deref().is_some_and(|p| !p.is_empty());
        if has_user != has_pass {
            return Err(ConfigError::InconsistentCredentials);
        }
        if mqtt.client_id.trim().is_empty() {
            mqtt.client_id = generate_client_id();
        }
        if mqtt.vehicle_id.trim().is_empty() {
            return Err(invalid("mqtt.vehicle_id", "must not be empty"));
        }
        if mqtt.keep_alive_secs < 5 {
            return Err(invalid("mqtt.keep_alive_secs", "must be at least 5"));
        }
        qos_from_level(mqtt.qos).map_err(|e| invalid("mqtt.qos", e.to_string()))?;

        if self.scheduler.interval_ms == 0 {
            return Err(invalid("scheduler.interval_ms", "must be positive"));
        }
        if self.scheduler.enabled {
            SchedulerConfig::pids_from_codes(&self.scheduler.pids)
                .map_err(|e| invalid("scheduler.pids", e.to_string()))?;
        }

        self.logging.max_level()?;

        let pipeline = &self.bridge;
        for (field, capacity) in [
            ("bridge.frame_channel", pipeline.frame_channel),
            ("bridge.telemetry_channel", pipeline.telemetry_channel),
            ("bridge.command_channel", pipeline.command_channel),
            ("bridge.response_channel", pipeline.response_channel),
        ] {
            if capacity == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if pipeline.response_timeout_ms == 0 {
            return Err(invalid("bridge.response_timeout_ms", "must be positive"));
        }

        // The broker address is checked here rather than on first connect
        self.bus_config()?.broker_endpoint().map_err(|e| invalid("mqtt.broker", e.to_string()))?;

        Ok(self)
    }

    pub fn link_config(&self) -> LinkConfig {
        let link = &self.link;
        LinkConfig {
            device_path: link.device_path.clone(),
            baud_rate: link.baud_rate,
            reconnect_interval: Duration::from_millis(link.reconnect_interval_ms),
            connect_timeout: Duration::from_millis(link.connect_timeout_ms),
            read_timeout: Duration::from_millis(link.read_timeout_ms),
            write_timeout: Duration::from_millis(link.write_timeout_ms),
            init_delay: Duration::from_millis(link.init_delay_ms),
            init_settle: Duration::from_millis(link.init_settle_ms),
            init_commands: link.init_commands.clone(),
        }
    }

    pub fn bus_config(&self) -> Result<BusConfig, ConfigError> {
        let mqtt = &self.mqtt;
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        Ok(BusConfig {
            broker: mqtt.broker.trim().to_string(),
            username: non_empty(&mqtt.username),
            password: non_empty(&mqtt.password),
            client_id: mqtt.client_id.clone(),
            data_topic: mqtt.data_topic.clone(),
            command_topic: mqtt.command_topic.clone(),
            qos: qos_from_level(mqtt.qos).map_err(|e| invalid("mqtt.qos", e.to_string()))?,
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            auto_reconnect: mqtt.auto_reconnect,
            reconnect_delay: Duration::from_millis(mqtt.reconnect_delay_ms),
            vehicle_id: mqtt.vehicle_id.clone(),
            flat_topics: mqtt.flat_topics,
            command_forward_timeout: Duration::from_millis(self.bridge.command_forward_timeout_ms),
            ..BusConfig::default()
        })
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        Ok(SchedulerConfig {
            interval: Duration::from_millis(self.scheduler.interval_ms),
            command_gap: Duration::from_millis(self.scheduler.command_gap_ms),
            pids: SchedulerConfig::pids_from_codes(&self.scheduler.pids)
                .map_err(|e| invalid("scheduler.pids", e.to_string()))?,
        })
    }

    /// Copy safe to print, with the password masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.as_deref().is_some_and(|p| !p.is_empty()) {
            copy.mqtt.password = Some("********".to_string());
        }
        copy
    }
}
