//! Friendly-name projection of the hub-keyed registry.
//!
//! MQTT topics use a device's friendly name: its user-assigned attribute name
//! when set, else the hub id, with the configured prefix prepended. The index
//! is derived from registry snapshots and rebuilt lazily after
//! [`NameIndex::invalidate`].

use pushok_hub::DeviceSnapshot;

/// Friendly name for one device.
pub fn friendly_name(prefix: &str, snapshot: &DeviceSnapshot) -> String {
    let base = snapshot
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&snapshot.device.id);
    format!("{}{}", prefix, base)
}

#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    prefix: String,
    /// `(device id, friendly name)` in device-id order. `None` when stale.
    entries: Option<Vec<(String, String)>>,
}

impl NameIndex {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_stale(&self) -> bool {
        self.entries.is_none()
    }

    pub fn invalidate(&mut self) {
        self.entries = None;
    }

    pub fn rebuild(&mut self, snapshots: &[DeviceSnapshot]) {
        let mut entries: Vec<(String, String)> = snapshots
            .iter()
            .map(|s| (s.device.id.clone(), friendly_name(&self.prefix, s)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        self.entries = Some(entries);
    }

    pub fn name_of(&self, device_id: &str) -> Option<&str> {
        self.entries
            .as_ref()?
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, name)| name.as_str())
    }

    /// Device id for a topic segment: friendly names win over raw hub ids.
    /// Duplicate friendly names resolve to the lowest device id.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let entries = self.entries.as_ref()?;
        entries
            .iter()
            .find(|(_, friendly)| friendly == name)
            .or_else(|| entries.iter().find(|(id, _)| id == name))
            .map(|(id, _)| id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushok_hub::{DeviceAttributes, DeviceDescription};

    fn snapshot(id: &str, name: Option<&str>) -> DeviceSnapshot {
        DeviceSnapshot {
            device: DeviceDescription::new(id),
            state: None,
            format: None,
            attributes: name.map(|n| DeviceAttributes {
                name: Some(n.to_string()),
                ..Default::default()
            }),
            adapter: None,
        }
    }

    #[test]
    fn test_friendly_name_fallbacks() {
        assert_eq!(friendly_name("", &snapshot("00:aa", Some("Kitchen"))), "Kitchen");
        assert_eq!(friendly_name("", &snapshot("00:aa", Some("  "))), "00:aa");
        assert_eq!(friendly_name("Hub1 ", &snapshot("00:aa", None)), "Hub1 00:aa");
    }

    #[test]
    fn test_resolve_prefers_friendly_name() {
        let mut index = NameIndex::new("");
        assert!(index.is_stale());
        assert_eq!(index.resolve("Kitchen"), None);

        // 00:bb is literally named after 00:aa's hub id.
        index.rebuild(&[
            snapshot("00:bb", Some("00:aa")),
            snapshot("00:aa", Some("Kitchen")),
        ]);
        assert_eq!(index.resolve("Kitchen"), Some("00:aa"));
        assert_eq!(index.resolve("00:aa"), Some("00:bb"));
        assert_eq!(index.resolve("00:bb"), Some("00:bb"));
        assert_eq!(index.resolve("Hall"), None);
        assert_eq!(index.name_of("00:bb"), Some("00:aa"));
    }

    #[test]
    fn test_duplicate_names_resolve_to_lowest_id() {
        let mut index = NameIndex::new("");
        index.rebuild(&[
            snapshot("00:cc", Some("Lamp")),
            snapshot("00:aa", Some("Lamp")),
        ]);
        assert_eq!(index.resolve("Lamp"), Some("00:aa"));
    }

    #[test]
    fn test_invalidate() {
        let mut index = NameIndex::new("x/");
        index.rebuild(&[snapshot("00:aa", None)]);
        assert_eq!(index.name_of("00:aa"), Some("x/00:aa"));
        index.invalidate();
        assert!(index.is_stale());
        assert_eq!(index.name_of("00:aa"), None);
    }
}
