//! Bridge error types.

use pushok_hub::{HubError, ModelError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// An inbound command or outbound document could not be built.
    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

impl From<ModelError> for BridgeError {
    fn from(err: ModelError) -> Self {
        BridgeError::Payload(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Payload(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
