//! Inbound `<base>/<friendly>/set` commands.
//!
//! A command is a JSON object of `{field name: display value}`. Each entry is
//! resolved against the device adapter, converted back to a raw device value
//! and written on its own; one failing field does not stop the others.

use pushok_hub::{DeviceAdapter, FieldValue, FieldWriter};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SetCommand {
    pub fields: Vec<(String, Value)>,
}

impl SetCommand {
    pub fn parse(payload: &[u8]) -> BridgeResult<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::Object(map) => Ok(Self {
                fields: map.into_iter().collect(),
            }),
            other => Err(BridgeError::Payload(format!(
                "set command must be an object, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    /// The hub accepted the write.
    Written { address: u32, value: FieldValue },
    /// The hub answered but reported the write as not applied.
    NotApplied { address: u32, value: FieldValue },
    /// No adapter parameter matches the name.
    Unresolved,
    /// The value could not be converted to a raw device value.
    Invalid(String),
    /// The write itself failed (timeout, link down, hub error).
    Failed { address: u32, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldResult {
    pub name: String,
    pub outcome: FieldOutcome,
}

impl FieldResult {
    pub fn is_written(&self) -> bool {
        matches!(self.outcome, FieldOutcome::Written { .. })
    }
}

/// Apply `command` to one device, one write per field, in payload order.
pub async fn apply<W>(
    writer: &W,
    device_id: &str,
    adapter: Option<&DeviceAdapter>,
    command: &SetCommand,
) -> Vec<FieldResult>
where
    W: FieldWriter + ?Sized,
{
    let mut results = Vec::with_capacity(command.fields.len());
    for (name, raw) in &command.fields {
        let outcome = apply_field(writer, device_id, adapter, name, raw).await;
        match &outcome {
            FieldOutcome::Written { address, value } => {
                info!(device_id, field = %name, address, value = %value, "Field set");
            }
            FieldOutcome::NotApplied { address, .. } => {
                warn!(device_id, field = %name, address, "Hub did not apply field");
            }
            FieldOutcome::Unresolved => {
                warn!(device_id, field = %name, "Unknown field in set command");
            }
            FieldOutcome::Invalid(reason) => {
                warn!(device_id, field = %name, "Rejected set value: {}", reason);
            }
            FieldOutcome::Failed { address, error } => {
                warn!(device_id, field = %name, address, "Field write failed: {}", error);
            }
        }
        results.push(FieldResult {
            name: name.clone(),
            outcome,
        });
    }
    results
}

async fn apply_field<W>(
    writer: &W,
    device_id: &str,
    adapter: Option<&DeviceAdapter>,
    name: &str,
    raw: &Value,
) -> FieldOutcome
where
    W: FieldWriter + ?Sized,
{
    let Some(param) = adapter.and_then(|a| a.resolve_param(name)) else {
        return FieldOutcome::Unresolved;
    };
    let Some(display) = FieldValue::from_json(raw) else {
        return FieldOutcome::Invalid(format!("{} is not a scalar", raw));
    };
    let value = match param.device_value(&display) {
        Ok(v) => v,
        Err(e) => return FieldOutcome::Invalid(e.to_string()),
    };

    let address = param.address;
    match writer.write_field(device_id, address, value.clone()).await {
        Ok(true) => FieldOutcome::Written { address, value },
        Ok(false) => FieldOutcome::NotApplied { address, value },
        Err(e) => FieldOutcome::Failed {
            address,
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_payload_order() {
        let command = SetCommand::parse(br#"{"state": true, "brightness": 50}"#).unwrap();
        let names: Vec<_> = command.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["state", "brightness"]);
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(matches!(
            SetCommand::parse(b"[1, 2]"),
            Err(BridgeError::Payload(_))
        ));
        assert!(matches!(
            SetCommand::parse(b"ON"),
            Err(BridgeError::Payload(_))
        ));
    }
}
