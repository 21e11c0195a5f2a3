//! Outbound MQTT topics and payloads.

use pushok_hub::DeviceSnapshot;
use serde_json::{Map, Value, json};

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Topic layout under the configured base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn bridge_state(&self) -> String {
        format!("{}/bridge/state", self.base)
    }

    pub fn bridge_devices(&self) -> String {
        format!("{}/bridge/devices", self.base)
    }

    pub fn state(&self, friendly: &str) -> String {
        format!("{}/{}", self.base, friendly)
    }

    pub fn availability(&self, friendly: &str) -> String {
        format!("{}/{}/availability", self.base, friendly)
    }

    pub fn set(&self, friendly: &str) -> String {
        format!("{}/{}/set", self.base, friendly)
    }

    /// Subscription filter matching every device's set topic.
    pub fn set_filter(&self) -> String {
        format!("{}/+/set", self.base)
    }

    /// Friendly name addressed by a set topic, if `topic` is one.
    pub fn parse_set<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let friendly = rest.strip_suffix("/set")?;
        if friendly.is_empty() || friendly.contains('/') {
            return None;
        }
        Some(friendly)
    }
}

pub fn bridge_state(online: bool) -> Value {
    json!({ "state": if online { "online" } else { "offline" } })
}

/// Flat `{display name: display value, ..., "linkquality": lqi}` map.
/// `None` when nothing is known about the device state yet.
pub fn device_state(snapshot: &DeviceSnapshot) -> Option<Value> {
    let state = snapshot.state.as_ref()?;
    let adapter = snapshot.adapter.as_deref();

    let mut payload = Map::new();
    for (field_id, prop) in &state.properties {
        let param = adapter.and_then(|a| a.param_by_address(*field_id));
        let name = match param {
            Some(p) => p.display_name(),
            None => format!("field_{}", field_id),
        };
        let value = match (&prop.value, param) {
            (Some(raw), Some(p)) => p.display_value(raw).to_json(),
            (Some(raw), None) => raw.to_json(),
            (None, _) => Value::Null,
        };
        payload.insert(name, value);
    }
    payload.insert("linkquality".to_string(), json!(snapshot.device.lqi));
    Some(Value::Object(payload))
}

/// A device flagged with a warning is reported offline.
pub fn availability(snapshot: &DeviceSnapshot) -> &'static str {
    if snapshot.device.warning {
        AVAILABILITY_OFFLINE
    } else {
        AVAILABILITY_ONLINE
    }
}

/// One `bridge/devices` entry. `definition` is present only when the
/// device's adapter is loaded.
pub fn device_entry(snapshot: &DeviceSnapshot, friendly: &str) -> Value {
    let device = &snapshot.device;
    let mut entry = json!({
        "ieee_address": device.id,
        "friendly_name": friendly,
        "model": device.model,
        "manufacturer": device.manufacturer,
    });
    if let Some(adapter) = &snapshot.adapter {
        entry["definition"] = json!({
            "description": adapter.description.as_deref().unwrap_or(&device.model),
            "model": device.model,
            "vendor": device.manufacturer,
        });
    }
    entry
}
