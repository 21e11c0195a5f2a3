//! MQTT bridge for the Pushok hub.
//!
//! Publishes hub devices in the zigbee2mqtt topic layout
//! (`<base>/<friendly name>`, `.../availability`, `.../set`) together with
//! Home Assistant discovery documents, and writes inbound set commands back
//! through [`pushok_hub::HubService`].

pub mod bridge;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod naming;
pub mod payload;

pub use bridge::{BridgeCore, DeviceCatalog, Inbound, MqttBridge, MqttPublisher, Publisher};
pub use command::{FieldOutcome, FieldResult, SetCommand};
pub use config::{BridgeConfig, MqttConfig};
pub use discovery::{Component, DiscoveryBuilder, DiscoveryDocument};
pub use error::{BridgeError, BridgeResult};
pub use naming::NameIndex;
pub use payload::Topics;
