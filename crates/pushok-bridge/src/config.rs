//! Bridge configuration: TOML file, environment, then command-line overrides.

use std::path::Path;
use std::time::Duration;

use pushok_hub::HubConfig;
use pushok_hub::config::parse_flag;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    pub const MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
    pub const MQTT_BASE_TOPIC: &str = "MQTT_BASE_TOPIC";
    pub const MQTT_DEVICE_PREFIX: &str = "MQTT_DEVICE_PREFIX";
    pub const MQTT_DISCOVERY_PREFIX: &str = "MQTT_DISCOVERY_PREFIX";
    pub const MQTT_DISCOVERY_ENABLED: &str = "MQTT_DISCOVERY_ENABLED";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "pushok_hub_bridge".to_string()
}

fn default_base_topic() -> String {
    "pushok_hub".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_true() -> bool {
    true
}

fn default_service_field_cutoff() -> u32 {
    200
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// MQTT broker and topic layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Prepended to every friendly name, e.g. `"Hub1 "`.
    #[serde(default)]
    pub device_prefix: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,
    /// Parameters above this address are service fields and get no discovery entity.
    #[serde(default = "default_service_field_cutoff")]
    pub service_field_cutoff: u32,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            device_prefix: String::new(),
            discovery_prefix: default_discovery_prefix(),
            discovery_enabled: true,
            service_field_cutoff: default_service_field_cutoff(),
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl MqttConfig {
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var(env_vars::MQTT_HOST) {
            self.host = host;
        }
        if let Some(port) = std::env::var(env_vars::MQTT_PORT)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.port = port;
        }
        if let Ok(username) = std::env::var(env_vars::MQTT_USERNAME) {
            self.username = Some(username).filter(|s| !s.is_empty());
        }
        if let Ok(password) = std::env::var(env_vars::MQTT_PASSWORD) {
            self.password = Some(password).filter(|s| !s.is_empty());
        }
        if let Ok(client_id) = std::env::var(env_vars::MQTT_CLIENT_ID) {
            self.client_id = client_id;
        }
        if let Ok(base) = std::env::var(env_vars::MQTT_BASE_TOPIC) {
            self.base_topic = base;
        }
        if let Ok(prefix) = std::env::var(env_vars::MQTT_DEVICE_PREFIX) {
            self.device_prefix = prefix;
        }
        if let Ok(prefix) = std::env::var(env_vars::MQTT_DISCOVERY_PREFIX) {
            self.discovery_prefix = prefix;
        }
        if let Some(enabled) = std::env::var(env_vars::MQTT_DISCOVERY_ENABLED)
            .ok()
            .and_then(|s| parse_flag(&s))
        {
            self.discovery_enabled = enabled;
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            mqtt: MqttConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    pub fn parse(content: &str) -> BridgeResult<Self> {
        toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Load a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.hub.apply_env();
        self.mqtt.apply_env();
        if let Ok(level) = std::env::var(env_vars::LOG_LEVEL) {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }

    /// `tracing` directive for the configured level. Accepts `WARNING`.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.trim().to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" | "critical" => "error",
            _ => "info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = BridgeConfig::parse("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.base_topic, "pushok_hub");
        assert_eq!(config.mqtt.service_field_cutoff, 200);
        assert_eq!(config.mqtt.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.hub.port, 3001);
    }

    #[test]
    fn test_partial_sections() {
        let config = BridgeConfig::parse(
            r#"
log_level = "DEBUG"

[hub]
host = "10.0.0.5"
private_key = "01"

[mqtt]
base_topic = "home/pushok"
discovery_enabled = false
"#,
        )
        .unwrap();
        assert_eq!(config.hub.host, "10.0.0.5");
        assert_eq!(config.hub.private_key.as_deref(), Some("01"));
        assert_eq!(config.hub.port, 3001);
        assert_eq!(config.mqtt.base_topic, "home/pushok");
        assert!(!config.mqtt.discovery_enabled);
        assert_eq!(config.mqtt.client_id, "pushok_hub_bridge");
        assert_eq!(config.log_directive(), "debug");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        assert!(matches!(
            BridgeConfig::parse("[mqtt]\nport = \"abc\""),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_log_directive() {
        let mut config = BridgeConfig::default();
        assert_eq!(config.log_directive(), "info");
        config.log_level = "WARNING".into();
        assert_eq!(config.log_directive(), "warn");
        config.log_level = "nonsense".into();
        assert_eq!(config.log_directive(), "info");
    }

    #[test]
    fn test_from_env_overlays_defaults() {
        std::env::set_var(env_vars::MQTT_DEVICE_PREFIX, "Hub1 ");
        let config = BridgeConfig::from_env();
        std::env::remove_var(env_vars::MQTT_DEVICE_PREFIX);

        assert_eq!(config.mqtt.device_prefix, "Hub1 ");
        assert_eq!(config.mqtt.base_topic, "pushok_hub");
    }
}
