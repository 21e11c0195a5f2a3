//! Home Assistant MQTT discovery documents.
//!
//! One document per adapter parameter at or below the service-field cutoff.
//! The entity kind follows the parameter's declared type and writability,
//! then its label table and widget hint:
//!
//! | type          | writable | labels / dropdown | component       |
//! |---------------|----------|-------------------|-----------------|
//! | `bool`        | yes      |                   | `switch`        |
//! | `bool`        | no       |                   | `binary_sensor` |
//! | `int`/`float` | yes      | yes               | `select`        |
//! | `int`/`float` | yes      | no                | `number`        |
//! | `int`/`float` | no       |                   | `sensor`        |
//!
//! Other parameter types get no entity.

use pushok_hub::{AdapterParam, DeviceSnapshot};
use serde_json::{Map, Value, json};

use crate::payload::Topics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Switch,
    BinarySensor,
    Select,
    Number,
    Sensor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Switch => "switch",
            Component::BinarySensor => "binary_sensor",
            Component::Select => "select",
            Component::Number => "number",
            Component::Sensor => "sensor",
        }
    }

    pub fn classify(param: &AdapterParam) -> Option<Self> {
        let writable = param.is_writable();
        match param.param_type.as_str() {
            "bool" if writable => Some(Component::Switch),
            "bool" => Some(Component::BinarySensor),
            "int" | "float" if !writable => Some(Component::Sensor),
            "int" | "float" => {
                let dropdown = param.view.widget.as_deref() == Some("dropdown");
                if dropdown || !param.labels.is_empty() {
                    Some(Component::Select)
                } else {
                    Some(Component::Number)
                }
            }
            _ => None,
        }
    }
}

/// Adapter unit key to display unit. Unknown units pass through.
pub fn map_unit(unit: &str) -> &str {
    match unit {
        "unit_C" => "°C",
        "unit_F" => "°F",
        "unit_%" => "%",
        "unit_voltage" => "V",
        "unit_mV" => "mV",
        "unit_power" => "W",
        "unit_mA" => "mA",
        "unit_A" => "A",
        "unit_energy" => "kWh",
        "unit_lux" => "lx",
        "unit_ppm" => "ppm",
        "unit_ppb" => "ppb",
        "unit_hPa" => "hPa",
        "unit_Pa" => "Pa",
        "unit_cm" => "cm",
        "unit_m" => "m",
        "unit_s" => "s",
        "unit_min" => "min",
        "unit_Hz" => "Hz",
        "unit_dB" => "dB",
        "unit_L" => "L",
        "unit_mL" => "mL",
        "unit_m3" => "m³",
        "unit_ugm3" => "µg/m³",
        other => other,
    }
}

fn sensor_device_class(name: &str) -> Option<&'static str> {
    Some(match name {
        "temperature" | "temp" => "temperature",
        "humidity" | "hum" => "humidity",
        "pressure" => "pressure",
        "battery" => "battery",
        "voltage" => "voltage",
        "current" => "current",
        "power" => "power",
        "energy" => "energy",
        "illuminance" | "lux" => "illuminance",
        "co2" => "carbon_dioxide",
        "pm25" => "pm25",
        "pm10" => "pm10",
        "voc" => "volatile_organic_compounds",
        "frequency" => "frequency",
        "signal_strength" => "signal_strength",
        "distance" => "distance",
        _ => return None,
    })
}

fn binary_sensor_device_class(name: &str) -> Option<&'static str> {
    Some(match name {
        "state" | "contact" | "open" => "opening",
        "door" => "door",
        "window" => "window",
        "motion" => "motion",
        "presense" | "presence" | "occupancy" => "occupancy",
        "smoke" => "smoke",
        "gas" => "gas",
        "co" => "carbon_monoxide",
        "water_leak" | "leak" | "moisture" => "moisture",
        "vibration" => "vibration",
        "tamper" => "tamper",
        "battery_low" => "battery",
        "problem" => "problem",
        _ => return None,
    })
}

fn switch_device_class(name: &str) -> Option<&'static str> {
    match name {
        "outlet" => Some("outlet"),
        "switch" => Some("switch"),
        _ => None,
    }
}

/// `"child_lock"` → `"Child Lock"`.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_alpha = false;
    for c in name.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDocument {
    pub component: Component,
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct DiscoveryBuilder {
    topics: Topics,
    prefix: String,
    cutoff: u32,
}

impl DiscoveryBuilder {
    pub fn new(topics: Topics, prefix: impl Into<String>, cutoff: u32) -> Self {
        Self {
            topics,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            cutoff,
        }
    }

    /// Documents for one device. Devices without a loaded adapter or state
    /// produce none.
    pub fn documents(&self, snapshot: &DeviceSnapshot, friendly: &str) -> Vec<DiscoveryDocument> {
        let (Some(adapter), Some(_)) = (&snapshot.adapter, &snapshot.state) else {
            return Vec::new();
        };
        let device = &snapshot.device;

        let mut device_info = json!({
            "identifiers": [device.id],
            "name": friendly,
            "model": device.model,
            "manufacturer": device.manufacturer,
        });
        if let Some(url) = &adapter.url {
            device_info["configuration_url"] = json!(url);
        }

        adapter
            .params
            .iter()
            .filter(|p| p.address <= self.cutoff)
            .filter_map(|param| {
                let component = Component::classify(param)?;
                let payload = self.entity(param, component, &device.id, friendly, &device_info);
                Some(DiscoveryDocument {
                    component,
                    topic: format!(
                        "{}/{}/{}/{}/config",
                        self.prefix,
                        component.as_str(),
                        node_id(&device.id),
                        param.address
                    ),
                    payload,
                })
            })
            .collect()
    }

    fn entity(
        &self,
        param: &AdapterParam,
        component: Component,
        device_id: &str,
        friendly: &str,
        device_info: &Value,
    ) -> Value {
        let name = param.display_name();
        let class_key = name.to_lowercase();

        let mut doc = Map::new();
        doc.insert("name".into(), json!(title_case(&name)));
        doc.insert("unique_id".into(), json!(format!("{}_{}", device_id, param.address)));
        doc.insert("state_topic".into(), json!(self.topics.state(friendly)));
        doc.insert(
            "value_template".into(),
            json!(format!("{{{{ value_json.{} }}}}", name)),
        );
        doc.insert("device".into(), device_info.clone());
        doc.insert(
            "availability_topic".into(),
            json!(self.topics.availability(friendly)),
        );

        let command_topic = json!(self.topics.set(friendly));
        match component {
            Component::Switch => {
                doc.insert("command_topic".into(), command_topic);
                doc.insert("payload_on".into(), json!(json!({ &name: true }).to_string()));
                doc.insert("payload_off".into(), json!(json!({ &name: false }).to_string()));
                doc.insert("state_on".into(), json!(true));
                doc.insert("state_off".into(), json!(false));
                if let Some(class) = switch_device_class(&class_key) {
                    doc.insert("device_class".into(), json!(class));
                }
            }
            Component::BinarySensor => {
                // The template renders booleans the Jinja way.
                doc.insert("payload_on".into(), json!("True"));
                doc.insert("payload_off".into(), json!("False"));
                if let Some(class) = binary_sensor_device_class(&class_key) {
                    doc.insert("device_class".into(), json!(class));
                }
            }
            Component::Select => {
                doc.insert("command_topic".into(), command_topic);
                let options: Vec<&str> = param.labels.labels().collect();
                doc.insert("options".into(), json!(options));
                doc.insert(
                    "command_template".into(),
                    json!(format!("{{\"{}\": \"{{{{ value }}}}\"}}", name)),
                );
            }
            Component::Number => {
                doc.insert("command_topic".into(), command_topic);
                doc.insert(
                    "command_template".into(),
                    json!(format!("{{\"{}\": {{{{ value }}}}}}", name)),
                );
                if let Some(min) = &param.min {
                    doc.insert("min".into(), Value::Number(min.clone()));
                }
                if let Some(max) = &param.max {
                    doc.insert("max".into(), Value::Number(max.clone()));
                }
            }
            Component::Sensor => {
                if let Some(unit) = &param.view.unit {
                    doc.insert("unit_of_measurement".into(), json!(map_unit(unit)));
                }
                if let Some(class) = sensor_device_class(&class_key) {
                    doc.insert("device_class".into(), json!(class));
                }
            }
        }
        Value::Object(doc)
    }
}

/// Discovery node ids allow only `[a-zA-Z0-9_-]`.
fn node_id(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
