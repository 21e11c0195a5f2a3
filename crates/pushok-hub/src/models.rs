//! Typed decode of hub payloads: device descriptions, sparse state, packed
//! field formats and per-driver adapter schemas.
//!
//! Decoding is best-effort. A payload that is not the expected shape as a
//! whole yields an empty value or a [`ModelError`]; an individual key that
//! fails to parse is logged and skipped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::conversion::{LabelTable, Program};
use crate::value::FieldValue;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("Expected a JSON object for {0}")]
    NotAnObject(&'static str),

    #[error("Missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Embedded JSON could not be parsed: {0}")]
    EmbeddedJson(String),

    #[error("Value {value} is not valid for field {field}: {reason}")]
    InvalidValue {
        field: u32,
        value: String,
        reason: String,
    },
}

pub type ModelResult<T> = Result<T, ModelError>;

// -- small typed accessors over a JSON object --------------------------------

fn get_str(map: &Map<String, Value>, key: &str, context: &str) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            warn!(context, key, "Expected string, got {}", other);
            None
        }
    }
}

fn get_i64(map: &Map<String, Value>, key: &str, context: &str) -> Option<i64> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => Some(v),
            None => {
                warn!(context, key, "Expected integer, got {}", n);
                None
            }
        },
        Some(other) => {
            warn!(context, key, "Expected integer, got {}", other);
            None
        }
    }
}

fn get_bool(map: &Map<String, Value>, key: &str, context: &str) -> Option<bool> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        // Some firmware reports flags as 0/1.
        Some(Value::Number(n)) if n.as_i64().is_some() => n.as_i64().map(|v| v != 0),
        Some(other) => {
            warn!(context, key, "Expected bool, got {}", other);
            None
        }
    }
}

fn get_number(map: &Map<String, Value>, key: &str) -> Option<Number> {
    match map.get(key) {
        Some(Value::Number(n)) => Some(n.clone()),
        _ => None,
    }
}

fn parse_field_id(key: &str) -> Option<u32> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// Accept either an object or a JSON document encoded as a string.
fn unwrap_embedded(value: &Value) -> ModelResult<Value> {
    match value {
        Value::String(s) => {
            serde_json::from_str(s).map_err(|e| ModelError::EmbeddedJson(e.to_string()))
        }
        other => Ok(other.clone()),
    }
}

// -- property values ---------------------------------------------------------

/// One field reading. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub value: Option<FieldValue>,
    pub time: Option<i64>,
    #[serde(default)]
    pub ack: bool,
}

impl PropertyValue {
    pub fn new(value: impl Into<FieldValue>) -> Self {
        Self {
            value: Some(value.into()),
            time: None,
            ack: false,
        }
    }

    pub fn from_json(data: &Value) -> ModelResult<Self> {
        let map = data
            .as_object()
            .ok_or(ModelError::NotAnObject("property value"))?;
        let value = match map.get("value") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(FieldValue::from_json(raw).ok_or_else(|| ModelError::InvalidKey {
                key: "value".to_string(),
                reason: format!("not a scalar: {}", raw),
            })?),
        };
        Ok(Self {
            value,
            time: get_i64(map, "time", "property"),
            ack: get_bool(map, "ack", "property").unwrap_or(false),
        })
    }
}

// -- device description ------------------------------------------------------

/// A device as listed by `listObjects`, mutated in place by broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub id: String,
    pub manufacturer: String,
    pub model: String,
    pub network_id: i64,
    pub driver: Option<String>,
    pub last_seen: Option<i64>,
    pub lqi: Option<i64>,
    pub warning: bool,
    pub has_description: bool,
    pub attr_crc: Option<i64>,
    pub adapter_crc: Option<i64>,
    pub error: Option<String>,
}

impl DeviceDescription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            manufacturer: "Unknown".to_string(),
            model: "Unknown".to_string(),
            network_id: 0,
            driver: None,
            last_seen: None,
            lqi: None,
            warning: false,
            has_description: false,
            attr_crc: None,
            adapter_crc: None,
            error: None,
        }
    }

    pub fn from_json(data: &Value) -> ModelResult<Self> {
        let map = data
            .as_object()
            .ok_or(ModelError::NotAnObject("device description"))?;
        let id = match map.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ModelError::MissingKey("id")),
        };
        let ctx = id.as_str();

        Ok(Self {
            manufacturer: get_str(map, "mnf", ctx).unwrap_or_else(|| "Unknown".to_string()),
            model: get_str(map, "mdl", ctx).unwrap_or_else(|| "Unknown".to_string()),
            network_id: get_i64(map, "netid", ctx).unwrap_or(0),
            driver: get_str(map, "drv", ctx),
            last_seen: get_i64(map, "lse", ctx),
            lqi: get_i64(map, "lqi", ctx),
            warning: get_bool(map, "warn", ctx).unwrap_or(false),
            has_description: get_bool(map, "desc", ctx).unwrap_or(false),
            attr_crc: get_i64(map, "attr", ctx),
            adapter_crc: get_i64(map, "adptr-crc", ctx),
            error: get_str(map, "error", ctx),
            id,
        })
    }

    /// Sparse merge: only keys present in `update` are overwritten.
    /// Returns whether anything changed.
    pub fn merge(&mut self, update: &Map<String, Value>) -> bool {
        let before = self.clone();
        let ctx = self.id.clone();
        let ctx = ctx.as_str();

        if let Some(v) = get_str(update, "mnf", ctx) {
            self.manufacturer = v;
        }
        if let Some(v) = get_str(update, "mdl", ctx) {
            self.model = v;
        }
        if let Some(v) = get_i64(update, "netid", ctx) {
            self.network_id = v;
        }
        if let Some(v) = get_str(update, "drv", ctx) {
            self.driver = Some(v);
        }
        if let Some(v) = get_i64(update, "lse", ctx) {
            self.last_seen = Some(v);
        }
        if let Some(v) = get_i64(update, "lqi", ctx) {
            self.lqi = Some(v);
        }
        if let Some(v) = get_bool(update, "warn", ctx) {
            self.warning = v;
        }
        if let Some(v) = get_i64(update, "attr", ctx) {
            self.attr_crc = Some(v);
        }
        if let Some(v) = get_i64(update, "adptr-crc", ctx) {
            self.adapter_crc = Some(v);
        }
        if update.contains_key("error") {
            self.error = get_str(update, "error", ctx);
        }

        *self != before
    }
}

// -- user attributes ---------------------------------------------------------

/// User-assigned attributes (`getAttributes` / `setAttributes`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub params_visibility: BTreeMap<u32, bool>,
}

impl DeviceAttributes {
    /// Decode a `getAttributes` result, which may be a JSON-encoded string.
    /// Anything that is not an object yields empty attributes.
    pub fn from_json(data: &Value) -> Self {
        let data = match unwrap_embedded(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Attributes payload ignored: {}", e);
                return Self::default();
            }
        };
        let Some(map) = data.as_object() else {
            return Self::default();
        };

        let tags = match map.get("tags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let mut params_visibility = BTreeMap::new();
        if let Some(Value::Object(pv)) = map.get("paramsVisibility") {
            for (key, visible) in pv {
                match (parse_field_id(key), visible.as_bool()) {
                    (Some(id), Some(v)) => {
                        params_visibility.insert(id, v);
                    }
                    _ => debug!(key = %key, "Skipping malformed visibility entry"),
                }
            }
        }

        Self {
            name: get_str(map, "name", "attributes").filter(|n| !n.is_empty()),
            tags,
            params_visibility,
        }
    }

    /// Wire shape for `setAttributes`.
    pub fn to_json(&self) -> Value {
        let visibility: Map<String, Value> = self
            .params_visibility
            .iter()
            .map(|(id, v)| (id.to_string(), Value::Bool(*v)))
            .collect();
        serde_json::json!({
            "name": self.name,
            "tags": self.tags,
            "paramsVisibility": visibility,
        })
    }
}

// -- state -------------------------------------------------------------------

/// Sparse field map for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub properties: BTreeMap<u32, PropertyValue>,
    pub adapter_crc: Option<i64>,
}

impl DeviceState {
    pub fn empty(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            properties: BTreeMap::new(),
            adapter_crc: None,
        }
    }

    pub fn from_json(device_id: &str, data: &Value) -> Self {
        let mut state = Self::empty(device_id);
        let Some(map) = data.as_object() else {
            return state;
        };
        state.adapter_crc = get_i64(map, "adptr-crc", device_id);
        state.apply_props(map);
        state
    }

    /// Replace or insert every well-formed `"<field-id>": {value, time, ack}`
    /// entry. Returns the ids that were applied.
    pub fn apply_props(&mut self, props: &Map<String, Value>) -> Vec<u32> {
        let mut applied = Vec::new();
        for (key, raw) in props {
            let Some(field_id) = parse_field_id(key) else {
                continue;
            };
            match PropertyValue::from_json(raw) {
                Ok(prop) => {
                    self.properties.insert(field_id, prop);
                    applied.push(field_id);
                }
                Err(e) => warn!(device_id = %self.device_id, field_id, "Skipping field: {}", e),
            }
        }
        applied
    }

    pub fn value(&self, field_id: u32) -> Option<&FieldValue> {
        self.properties.get(&field_id).and_then(|p| p.value.as_ref())
    }
}

// -- packed formats ----------------------------------------------------------

/// Wire data type ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Bool = 0,
    UInt8 = 1,
    UInt16 = 2,
    UInt32 = 3,
    Int8 = 4,
    Int16 = 5,
    Int32 = 6,
    Float = 7,
}

impl DataType {
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Some(match ordinal {
            0 => Self::Bool,
            1 => Self::UInt8,
            2 => Self::UInt16,
            3 => Self::UInt32,
            4 => Self::Int8,
            5 => Self::Int16,
            6 => Self::Int32,
            7 => Self::Float,
            _ => return None,
        })
    }

    /// Inclusive range for integer types.
    pub fn int_range(self) -> Option<(i64, i64)> {
        match self {
            Self::UInt8 => Some((0, u8::MAX as i64)),
            Self::UInt16 => Some((0, u16::MAX as i64)),
            Self::UInt32 => Some((0, u32::MAX as i64)),
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::Bool | Self::Float => None,
        }
    }
}

/// Field metadata unpacked from one integer:
/// byte 0 data type, byte 1 access, byte 2 category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFormat {
    pub field_id: u32,
    pub data_type: u8,
    pub access: u8,
    pub field_type: u8,
}

impl FieldFormat {
    pub fn decode(field_id: u32, raw: u32) -> Self {
        Self {
            field_id,
            data_type: (raw & 0xFF) as u8,
            access: ((raw >> 8) & 0xFF) as u8,
            field_type: ((raw >> 16) & 0xFF) as u8,
        }
    }

    pub fn kind(&self) -> Option<DataType> {
        DataType::from_ordinal(self.data_type)
    }

    pub fn is_read_only(&self) -> bool {
        self.access == 0
    }

    pub fn is_bool(&self) -> bool {
        self.data_type == DataType::Bool as u8
    }

    pub fn is_numeric(&self) -> bool {
        self.data_type <= DataType::Float as u8
    }

    /// Coerce a value to this field's wire type.
    ///
    /// Booleans accept 0/1, integer fields accept integral floats within
    /// range, float fields accept integers. Unknown data types pass through.
    pub fn coerce(&self, value: FieldValue) -> ModelResult<FieldValue> {
        let reject = |value: &FieldValue, reason: &str| ModelError::InvalidValue {
            field: self.field_id,
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let Some(kind) = self.kind() else {
            return Ok(value);
        };

        match kind {
            DataType::Bool => match value {
                FieldValue::Bool(_) => Ok(value),
                FieldValue::Int(0) => Ok(FieldValue::Bool(false)),
                FieldValue::Int(1) => Ok(FieldValue::Bool(true)),
                ref other => Err(reject(other, "expected bool")),
            },
            DataType::Float => match value {
                FieldValue::Int(i) => Ok(FieldValue::Float(i as f64)),
                FieldValue::Float(_) => Ok(value),
                ref other => Err(reject(other, "expected number")),
            },
            int_kind => {
                let as_int = match value {
                    FieldValue::Int(i) => i,
                    FieldValue::Float(f) if f.fract() == 0.0 && f.is_finite() => f as i64,
                    FieldValue::Bool(b) => b as i64,
                    ref other => return Err(reject(other, "expected integer")),
                };
                match int_kind.int_range() {
                    Some((lo, hi)) if as_int < lo || as_int > hi => {
                        Err(reject(&FieldValue::Int(as_int), "out of range"))
                    }
                    _ => Ok(FieldValue::Int(as_int)),
                }
            }
        }
    }
}

/// All field formats of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFormat {
    pub device_id: String,
    pub fields: BTreeMap<u32, FieldFormat>,
}

impl DeviceFormat {
    pub fn from_json(device_id: &str, data: &Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(map) = data.as_object() {
            for (key, raw) in map {
                let Some(field_id) = parse_field_id(key) else {
                    continue;
                };
                match raw.as_u64().and_then(|r| u32::try_from(r).ok()) {
                    Some(packed) => {
                        fields.insert(field_id, FieldFormat::decode(field_id, packed));
                    }
                    None => warn!(device_id, field_id, "Skipping malformed format: {}", raw),
                }
            }
        }
        Self {
            device_id: device_id.to_string(),
            fields,
        }
    }

    pub fn field(&self, field_id: u32) -> Option<&FieldFormat> {
        self.fields.get(&field_id)
    }
}

// -- adapters ----------------------------------------------------------------

/// Display hints from `viewParams`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewParams {
    pub name: Option<String>,
    pub unit: Option<String>,
    /// UI widget kind, e.g. `dropdown`.
    pub widget: Option<String>,
    pub raw: Map<String, Value>,
}

/// One parameter of a driver adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterParam {
    pub address: u32,
    pub access: String,
    pub param_type: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub min: Option<Number>,
    pub max: Option<Number>,
    pub labels: LabelTable,
    pub view: ViewParams,
    pub conversion: Program,
    pub inversion: Program,
}

impl AdapterParam {
    pub fn from_json(data: &Value) -> ModelResult<Self> {
        let map = data
            .as_object()
            .ok_or(ModelError::NotAnObject("adapter param"))?;
        let address = map
            .get("address")
            .and_then(Value::as_u64)
            .and_then(|a| u32::try_from(a).ok())
            .ok_or(ModelError::MissingKey("address"))?;
        let ctx = format!("param {}", address);
        let ctx = ctx.as_str();

        let view_raw = match map.get("viewParams") {
            Some(Value::Object(v)) => v.clone(),
            _ => Map::new(),
        };
        let view = ViewParams {
            name: get_str(&view_raw, "name", ctx),
            unit: get_str(&view_raw, "unit", ctx),
            widget: get_str(&view_raw, "type", ctx),
            raw: view_raw,
        };

        let labels = match map.get("labels") {
            Some(Value::Object(l)) => LabelTable::from_json(l),
            _ => LabelTable::default(),
        };

        let program = |which: &str| -> Program {
            let Some(Value::Object(convert)) = map.get("convert") else {
                return Program::default();
            };
            match convert.get(which) {
                None | Some(Value::Null) => Program::default(),
                Some(tokens) => Program::from_json(tokens).unwrap_or_else(|e| {
                    warn!(address, which, "Ignoring conversion program: {}", e);
                    Program::default()
                }),
            }
        };

        Ok(Self {
            address,
            access: get_str(map, "access", ctx).unwrap_or_else(|| "r".to_string()),
            param_type: get_str(map, "type", ctx).unwrap_or_else(|| "int".to_string()),
            name: view.name.clone(),
            description: get_str(map, "description", ctx),
            min: get_number(map, "min"),
            max: get_number(map, "max"),
            labels,
            conversion: program("conversion"),
            inversion: program("inversion"),
            view,
        })
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains('r')
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains('w')
    }

    /// External field name: the declared name, else `field_<address>`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("field_{}", self.address),
        }
    }

    /// Raw device value → display value. Labels take precedence over the
    /// conversion program; booleans are never converted.
    pub fn display_value(&self, raw: &FieldValue) -> FieldValue {
        if raw.is_bool() {
            if let Some(label) = self.labels.label_for(raw) {
                return FieldValue::Text(label.to_string());
            }
            return raw.clone();
        }
        if let Some(label) = self.labels.label_for(raw) {
            return FieldValue::Text(label.to_string());
        }
        match raw.as_f64() {
            Some(x) if !self.conversion.is_empty() => FieldValue::Float(self.conversion.evaluate(x)),
            _ => raw.clone(),
        }
    }

    /// Display value → raw device value.
    ///
    /// Strings are resolved through the label table first. The resulting
    /// number then goes through the inversion program; for `int` parameters
    /// it is rounded half away from zero.
    pub fn device_value(&self, display: &FieldValue) -> ModelResult<FieldValue> {
        let invalid = |reason: &str| ModelError::InvalidValue {
            field: self.address,
            value: display.to_string(),
            reason: reason.to_string(),
        };

        let value = match display {
            FieldValue::Text(label) if !self.labels.is_empty() => self
                .labels
                .value_for(label)
                .cloned()
                .ok_or_else(|| invalid("unknown label"))?,
            FieldValue::Text(text) => match text.trim().parse::<f64>() {
                Ok(x) => FieldValue::Float(x),
                Err(_) => match text.to_lowercase().as_str() {
                    "true" | "on" if self.param_type == "bool" => FieldValue::Bool(true),
                    "false" | "off" if self.param_type == "bool" => FieldValue::Bool(false),
                    _ => return Err(invalid("not a number")),
                },
            },
            other => other.clone(),
        };

        let Some(x) = value.as_f64() else {
            return Ok(value);
        };
        let x = if self.inversion.is_empty() {
            x
        } else {
            self.inversion.evaluate(x)
        };

        Ok(match self.param_type.as_str() {
            "int" => FieldValue::Int(x.round() as i64),
            "bool" => FieldValue::Bool(x != 0.0),
            "float" => FieldValue::Float(x),
            _ => match value {
                FieldValue::Int(_) if self.inversion.is_empty() => value,
                _ => FieldValue::Float(x),
            },
        })
    }
}

/// Per-driver schema from `getAdapter`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAdapter {
    pub driver: String,
    pub crc: i64,
    pub description: Option<String>,
    pub device_type: Option<String>,
    pub url: Option<String>,
    pub params: Vec<AdapterParam>,
}

impl DeviceAdapter {
    /// Decode a `{crc, content}` result; `content` may be a JSON string.
    pub fn from_response(driver: &str, data: &Value) -> ModelResult<Self> {
        let map = data
            .as_object()
            .ok_or(ModelError::NotAnObject("adapter response"))?;
        let crc = get_i64(map, "crc", driver).unwrap_or(0);
        let content = match map.get("content") {
            Some(c) => unwrap_embedded(c)?,
            None => Value::Object(Map::new()),
        };
        let content = content
            .as_object()
            .ok_or(ModelError::NotAnObject("adapter content"))?;

        let mut params = Vec::new();
        if let Some(Value::Array(items)) = content.get("params") {
            for item in items {
                match AdapterParam::from_json(item) {
                    Ok(p) => params.push(p),
                    Err(e) => warn!(driver, "Skipping adapter param: {}", e),
                }
            }
        }

        Ok(Self {
            driver: driver.to_string(),
            crc,
            description: get_str(content, "description", driver),
            device_type: get_str(content, "type", driver),
            url: get_str(content, "url", driver),
            params,
        })
    }

    pub fn param_by_address(&self, address: u32) -> Option<&AdapterParam> {
        self.params.iter().find(|p| p.address == address)
    }

    /// Exact name match, then case-insensitive.
    pub fn param_by_name(&self, name: &str) -> Option<&AdapterParam> {
        self.params
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .or_else(|| {
                let wanted = name.to_lowercase();
                self.params
                    .iter()
                    .find(|p| p.name.as_ref().is_some_and(|n| n.to_lowercase() == wanted))
            })
    }

    /// Name lookup that also understands the `field_<address>` fallback names.
    pub fn resolve_param(&self, name: &str) -> Option<&AdapterParam> {
        self.param_by_name(name).or_else(|| {
            name.strip_prefix("field_")
                .and_then(parse_field_id)
                .and_then(|address| self.param_by_address(address))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn brightness_adapter() -> DeviceAdapter {
        DeviceAdapter::from_response(
            "dimmer",
            &json!({
                "crc": 77,
                "content": {
                    "description": "Dimmer",
                    "type": "light",
                    "params": [
                        {"address": 1, "access": "rw", "type": "bool", "viewParams": {"name": "state"}},
                        {"address": 2, "access": "rw", "type": "int",
                         "viewParams": {"name": "brightness"},
                         "convert": {"conversion": ["self", 2.55, "/"], "inversion": ["self", 2.55, "*"]}},
                        {"address": 3, "access": "r", "type": "int",
                         "viewParams": {"name": "Mode", "type": "dropdown"},
                         "labels": {"Eco": 0, "Comfort": 1}},
                        {"access": "r"},
                        {"address": 4, "type": "float", "viewParams": {"unit": "unit_C"},
                         "convert": {"conversion": ["self", "+"]}}
                    ]
                }
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_field_format_decode() {
        let f = FieldFormat::decode(9, 0x000105);
        assert_eq!(f.data_type, 5);
        assert_eq!(f.access, 1);
        assert_eq!(f.field_type, 0);
        assert!(!f.is_read_only());
        assert!(f.is_numeric());
        assert_eq!(f.kind(), Some(DataType::Int16));

        let f = FieldFormat::decode(1, 0x020000);
        assert!(f.is_read_only());
        assert!(f.is_bool());
        assert_eq!(f.field_type, 2);

        assert!(!FieldFormat::decode(1, 0x08).is_numeric());
    }

    #[test]
    fn test_field_format_coerce() {
        let boolean = FieldFormat::decode(1, 0x0100);
        assert_eq!(boolean.coerce(FieldValue::Int(1)), Ok(FieldValue::Bool(true)));
        assert!(boolean.coerce(FieldValue::Int(2)).is_err());

        let u8_field = FieldFormat::decode(2, 0x0101);
        assert_eq!(u8_field.coerce(FieldValue::Float(12.0)), Ok(FieldValue::Int(12)));
        assert!(u8_field.coerce(FieldValue::Float(1.5)).is_err());
        assert!(u8_field.coerce(FieldValue::Int(256)).is_err());

        let float = FieldFormat::decode(3, 0x0107);
        assert_eq!(float.coerce(FieldValue::Int(3)), Ok(FieldValue::Float(3.0)));
        assert!(float.coerce(FieldValue::from("x")).is_err());
    }

    #[test]
    fn test_device_description_defaults_and_merge() {
        let mut dev = DeviceDescription::from_json(&json!({
            "id": "00:11", "drv": "dimmer", "lqi": 100, "lse": 5, "warn": false
        }))
        .unwrap();
        assert_eq!(dev.manufacturer, "Unknown");
        assert_eq!(dev.model, "Unknown");
        assert_eq!(dev.network_id, 0);

        let changed = dev.merge(json!({"lqi": 42, "netid": "bogus"}).as_object().unwrap());
        assert!(changed);
        assert_eq!(dev.lqi, Some(42));
        assert_eq!(dev.last_seen, Some(5));
        assert_eq!(dev.driver.as_deref(), Some("dimmer"));
        assert_eq!(dev.network_id, 0);

        assert!(!dev.merge(json!({"lqi": 42}).as_object().unwrap()));
        assert!(DeviceDescription::from_json(&json!({"mnf": "x"})).is_err());
    }

    #[test]
    fn test_device_state_sparse_update() {
        let mut state = DeviceState::from_json(
            "dev",
            &json!({
                "1": {"value": true, "time": 10, "ack": true},
                "2": {"value": 100},
                "adptr-crc": 77,
                "x": {"value": 1}
            }),
        );
        assert_eq!(state.adapter_crc, Some(77));
        assert_eq!(state.properties.len(), 2);
        assert!(state.properties[&1].ack);

        let applied = state.apply_props(
            json!({"2": {"value": 50, "time": 11}, "3": "garbage", "4": {"value": [1]}})
                .as_object()
                .unwrap(),
        );
        assert_eq!(applied, vec![2]);
        assert_eq!(state.value(1), Some(&FieldValue::Bool(true)));
        assert_eq!(state.value(2), Some(&FieldValue::Int(50)));
        assert!(!state.properties.contains_key(&3));
    }

    #[test]
    fn test_attributes_from_string() {
        let attrs = DeviceAttributes::from_json(&json!(
            r#"{"name": "Kitchen", "tags": ["a"], "paramsVisibility": {"3": false, "x": true}}"#
        ));
        assert_eq!(attrs.name.as_deref(), Some("Kitchen"));
        assert_eq!(attrs.tags, vec!["a"]);
        assert_eq!(attrs.params_visibility.get(&3), Some(&false));
        assert_eq!(attrs.params_visibility.len(), 1);

        assert_eq!(DeviceAttributes::from_json(&json!(5)), DeviceAttributes::default());
        assert_eq!(
            attrs.to_json()["paramsVisibility"],
            json!({"3": false})
        );
    }

    #[test]
    fn test_adapter_decode_skips_bad_params() {
        let adapter = brightness_adapter();
        assert_eq!(adapter.crc, 77);
        assert_eq!(adapter.device_type.as_deref(), Some("light"));
        assert_eq!(adapter.params.len(), 4);

        // Invalid program dropped, param kept.
        let temp = adapter.param_by_address(4).unwrap();
        assert!(temp.conversion.is_empty());
        assert_eq!(temp.display_name(), "field_4");
        assert_eq!(temp.access, "r");
    }

    #[test]
    fn test_adapter_content_as_string() {
        let adapter = DeviceAdapter::from_response(
            "contact",
            &json!({"crc": 1, "content": "{\"params\": [{\"address\": 1, \"type\": \"bool\"}]}"}),
        )
        .unwrap();
        assert_eq!(adapter.params.len(), 1);
        assert!(DeviceAdapter::from_response("c", &json!({"content": "{oops"})).is_err());
    }

    #[test]
    fn test_param_lookup() {
        let adapter = brightness_adapter();
        assert_eq!(adapter.param_by_name("brightness").unwrap().address, 2);
        assert_eq!(adapter.param_by_name("mode").unwrap().address, 3);
        assert_eq!(adapter.resolve_param("field_4").unwrap().address, 4);
        assert!(adapter.resolve_param("field_x").is_none());
    }

    #[test]
    fn test_display_value() {
        let adapter = brightness_adapter();
        let brightness = adapter.param_by_address(2).unwrap();
        assert_eq!(
            brightness.display_value(&FieldValue::Int(255)),
            FieldValue::Float(100.0)
        );
        let state = adapter.param_by_address(1).unwrap();
        assert_eq!(
            state.display_value(&FieldValue::Bool(true)),
            FieldValue::Bool(true)
        );
        let mode = adapter.param_by_address(3).unwrap();
        assert_eq!(mode.display_value(&FieldValue::Int(1)), FieldValue::from("Comfort"));
        assert_eq!(mode.display_value(&FieldValue::Int(7)), FieldValue::Int(7));
    }

    #[test]
    fn test_device_value_rounds_int_params() {
        let adapter = brightness_adapter();
        let brightness = adapter.param_by_name("brightness").unwrap();
        // 50 * 2.55 = 127.49999999999999 in binary floating point.
        assert_eq!(
            brightness.device_value(&FieldValue::Int(50)),
            Ok(FieldValue::Int(127))
        );
        assert_eq!(
            brightness.device_value(&FieldValue::Int(100)),
            Ok(FieldValue::Int(255))
        );
    }

    #[test]
    fn test_device_value_labels_and_text() {
        let adapter = brightness_adapter();
        let mode = adapter.param_by_address(3).unwrap();
        assert_eq!(mode.device_value(&FieldValue::from("comfort")), Ok(FieldValue::Int(1)));
        assert!(mode.device_value(&FieldValue::from("turbo")).is_err());

        let state = adapter.param_by_address(1).unwrap();
        assert_eq!(state.device_value(&FieldValue::Bool(false)), Ok(FieldValue::Bool(false)));
        assert_eq!(state.device_value(&FieldValue::from("ON")), Ok(FieldValue::Bool(true)));

        let brightness = adapter.param_by_address(2).unwrap();
        assert!(brightness.device_value(&FieldValue::from("bright")).is_err());
    }

    #[test]
    fn test_device_value_inverts_label_values() {
        let param = AdapterParam::from_json(&json!({
            "address": 5, "access": "rw", "type": "int",
            "viewParams": {"name": "speed"},
            "labels": {"low": 1, "high": 2},
            "convert": {"conversion": ["self", 10, "/"], "inversion": ["self", 10, "*"]}
        }))
        .unwrap();

        assert_eq!(param.device_value(&FieldValue::from("high")), Ok(FieldValue::Int(20)));
        assert_eq!(param.device_value(&FieldValue::from("LOW")), Ok(FieldValue::Int(10)));
        assert_eq!(param.device_value(&FieldValue::Int(3)), Ok(FieldValue::Int(30)));
    }
}
