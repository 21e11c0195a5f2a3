//! Hub connection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_PORT, REMOTE_GATEWAY_HOST, REMOTE_GATEWAY_PORT};

/// Environment variable names.
pub mod env_vars {
    pub const HOST: &str = "PUSHOK_HUB_HOST";
    pub const PORT: &str = "PUSHOK_HUB_PORT";
    pub const USE_SSL: &str = "PUSHOK_HUB_SSL";
    pub const HUB_ID: &str = "PUSHOK_HUB_ID";
    pub const PRIVATE_KEY: &str = "PUSHOK_HUB_PRIVATE_KEY";
    pub const USER_ID: &str = "PUSHOK_HUB_USER_ID";
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_command_timeout() -> u64 {
    5
}

fn default_reconnect_interval() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    10
}

/// Parse an environment flag: `true`/`1`/`yes`/`on`, case-insensitive.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    /// When set, connect through the cloud relay instead of `host:port`.
    #[serde(default)]
    pub hub_id: Option<String>,
    /// Hex private scalar. Generated on first run when absent.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Base64 user id. Generated on first run when absent.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            use_ssl: false,
            hub_id: None,
            private_key: None,
            user_id: None,
            command_timeout_secs: default_command_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl HubConfig {
    /// Overlay values found in the environment. Unparsable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var(env_vars::HOST) {
            self.host = host;
        }
        if let Some(port) = std::env::var(env_vars::PORT)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.port = port;
        }
        if let Some(ssl) = std::env::var(env_vars::USE_SSL)
            .ok()
            .and_then(|s| parse_flag(&s))
        {
            self.use_ssl = ssl;
        }
        if let Ok(id) = std::env::var(env_vars::HUB_ID) {
            self.hub_id = Some(id).filter(|s| !s.is_empty());
        }
        if let Ok(key) = std::env::var(env_vars::PRIVATE_KEY) {
            self.private_key = Some(key).filter(|s| !s.is_empty());
        }
        if let Ok(user) = std::env::var(env_vars::USER_ID) {
            self.user_id = Some(user).filter(|s| !s.is_empty());
        }
    }

    pub fn is_remote(&self) -> bool {
        self.hub_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// WebSocket URL for this configuration.
    pub fn websocket_url(&self) -> String {
        match self.hub_id.as_deref().filter(|id| !id.is_empty()) {
            Some(hub_id) => format!(
                "wss://{}:{}/{}/client",
                REMOTE_GATEWAY_HOST, REMOTE_GATEWAY_PORT, hub_id
            ),
            None => {
                let scheme = if self.use_ssl { "wss" } else { "ws" };
                format!("{}://{}:{}", scheme, self.host, self.port)
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: HubConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.port, 3001);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_websocket_url() {
        let mut config = HubConfig {
            host: "192.168.1.20".to_string(),
            ..Default::default()
        };
        assert_eq!(config.websocket_url(), "ws://192.168.1.20:3001");

        config.use_ssl = true;
        config.port = 443;
        assert_eq!(config.websocket_url(), "wss://192.168.1.20:443");

        config.hub_id = Some("abc123".to_string());
        assert!(config.is_remote());
        assert_eq!(
            config.websocket_url(),
            "wss://iotgate.pushok.net:443/abc123/client"
        );
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
