//! Hub RPC wire format: request/response envelopes, broadcasts and constants.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{HubError, HubResult};

/// RPC method names.
pub mod methods {
    pub const PUB_KEY: &str = "pubKey";
    pub const CHALLENGE: &str = "challenge";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const ADD_USER: &str = "addUser";
    pub const LIST_OBJECTS: &str = "listObjects";
    pub const GET_STATE: &str = "getState";
    pub const SET_STATE: &str = "setState";
    pub const GET_ATTRIBUTES: &str = "getAttributes";
    pub const SET_ATTRIBUTES: &str = "setAttributes";
    pub const GET_FORMAT: &str = "getFormat";
    pub const GET_ADAPTER: &str = "getAdapter";
}

/// Broadcast event names.
pub mod events {
    pub const OBJECT_UPDATE: &str = "object_update";
    pub const NOTIFICATION: &str = "notification";
    pub const DEVICE_STATE_CHANGE: &str = "device_state_change";
}

/// Version string sent with `authenticate`.
pub const CLIENT_VERSION: &str = "0.1.0";

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_PORT: u16 = 3001;
pub const REMOTE_GATEWAY_HOST: &str = "iotgate.pushok.net";
pub const REMOTE_GATEWAY_PORT: u16 = 443;

/// Access level granted by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Guest,
    Admin,
    User,
}

impl Role {
    pub fn from_wire(value: i64) -> Self {
        match value {
            1 => Self::Admin,
            2 => Self::User,
            _ => Self::Guest,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Self::Guest => 0,
            Self::Admin => 1,
            Self::User => 2,
        }
    }
}

/// Object namespace for `listObjects`, `getState` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityType {
    #[default]
    Zigbee,
    Automation,
    Gateway,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zigbee => "zigbee",
            Self::Automation => "automation",
            Self::Gateway => "gateway",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing command: `{"id": 1, "m": "getState", "p": {...}}`.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub m: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<&'a Value>,
}

impl Request<'_> {
    pub fn to_text(&self) -> HubResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Push event from the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub evt: String,
    pub id: Option<String>,
    pub entity_type: Option<String>,
    pub props: Option<Map<String, Value>>,
    /// The whole `broadcast` object, for events that are forwarded unchanged.
    pub raw: Value,
}

impl Broadcast {
    fn from_json(raw: Value) -> HubResult<Self> {
        let map = raw
            .as_object()
            .ok_or_else(|| HubError::Parse("broadcast is not an object".to_string()))?;
        let evt = map
            .get("evt")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::Parse("broadcast without evt".to_string()))?
            .to_string();
        let id = match map.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let entity_type = map.get("type").and_then(Value::as_str).map(str::to_string);
        let props = map.get("props").and_then(Value::as_object).cloned();

        Ok(Self {
            evt,
            id,
            entity_type,
            props,
            raw,
        })
    }
}

/// Explicit error envelope: `{"id": n, "error": "E_CODE", "msg": "..."}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Broadcast(Broadcast),
    Response {
        id: u64,
        outcome: Result<Value, ErrorReply>,
    },
    /// Valid JSON that is neither a broadcast nor a correlatable response.
    Other,
}

impl Incoming {
    pub fn parse(text: &str) -> HubResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut map) = value else {
            return Ok(Self::Other);
        };

        if let Some(broadcast) = map.remove("broadcast") {
            return Broadcast::from_json(broadcast).map(Self::Broadcast);
        }

        let Some(id) = map.get("id").and_then(Value::as_u64).filter(|id| *id > 0) else {
            return Ok(Self::Other);
        };

        let outcome = match map.remove("error") {
            Some(code) => Err(ErrorReply {
                code: match code {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                message: map
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            None => Ok(map.remove("result").unwrap_or(Value::Null)),
        };

        Ok(Self::Response { id, outcome })
    }
}
