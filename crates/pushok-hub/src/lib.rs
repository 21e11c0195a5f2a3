//! Client library for the Pushok home-automation hub.
//!
//! - [`auth`]: ECDH/AES-GCM/ECDSA mutual authentication
//! - [`client`]: command multiplexing and broadcast dispatch over one socket
//! - [`models`] / [`conversion`]: typed device schema and value conversion
//! - [`service`]: device registry, reconnection and the consumer-facing API
//!
//! ```no_run
//! use std::sync::Arc;
//! use pushok_hub::{HubAuth, HubClient, HubConfig, HubService, WebSocketConnector};
//!
//! # async fn run() -> pushok_hub::HubResult<()> {
//! let config = HubConfig::default();
//! let auth = HubAuth::new(config.private_key.as_deref(), config.user_id.as_deref())?;
//! let connector = WebSocketConnector::new(config.websocket_url(), config.ping_interval());
//! let client = Arc::new(HubClient::new(Arc::new(connector), auth));
//! let service = HubService::new(client);
//! service.setup().await;
//! for device in service.devices().await {
//!     println!("{} {}", device.id, device.model);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod conversion;
pub mod error;
pub mod models;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod value;

pub use auth::HubAuth;
pub use client::{HubClient, LinkEvent};
pub use config::HubConfig;
pub use conversion::{ConversionError, LabelTable, Program};
pub use error::{HandshakeError, HubError, HubResult};
pub use models::{
    AdapterParam, DataType, DeviceAdapter, DeviceAttributes, DeviceDescription, DeviceFormat,
    DeviceState, FieldFormat, ModelError, PropertyValue,
};
pub use protocol::{EntityType, Role};
pub use service::{DeviceEvent, DeviceSnapshot, FieldWriter, HubService};
pub use transport::{Connector, Frame, TaskGuard, Transport, WebSocketConnector};
pub use value::FieldValue;
