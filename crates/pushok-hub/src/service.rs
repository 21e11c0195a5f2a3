//! Hub-keyed device registry kept in sync with the link.
//!
//! [`HubService`] owns the [`HubClient`], loads the device catalog after every
//! (re)connection, applies `object_update` broadcasts to the registry and
//! fans the result out as [`DeviceEvent`]s. It is the single entry point for
//! consumers that present or bridge devices.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{HubClient, LinkEvent};
use crate::error::{HubError, HubResult};
use crate::models::{DeviceAdapter, DeviceAttributes, DeviceDescription, DeviceFormat, DeviceState};
use crate::protocol::{Broadcast, EntityType, RECONNECT_INTERVAL, events};
use crate::value::FieldValue;

const EVENT_CAPACITY: usize = 512;

/// Change notifications for registry consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// An accepted `object_update`. `fields` lists the field ids applied.
    StateChanged { device_id: String, fields: Vec<u32> },
    /// User attributes (and so possibly the friendly name) changed.
    AttributesChanged { device_id: String },
    /// The catalog was (re)loaded after a connection.
    DevicesReloaded,
    /// Any other broadcast, forwarded unchanged.
    Notification { event: String, payload: Value },
    ConnectionLost,
}

/// Everything known about one device at a point in time.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device: DeviceDescription,
    pub state: Option<DeviceState>,
    pub format: Option<DeviceFormat>,
    pub attributes: Option<DeviceAttributes>,
    pub adapter: Option<Arc<DeviceAdapter>>,
}

#[derive(Default)]
struct Registry {
    devices: BTreeMap<String, DeviceDescription>,
    states: HashMap<String, DeviceState>,
    formats: HashMap<String, DeviceFormat>,
    attributes: HashMap<String, DeviceAttributes>,
    /// Keyed by driver. Kept for the process lifetime.
    adapters: HashMap<String, Arc<DeviceAdapter>>,
}

impl Registry {
    fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let device = self.devices.get(device_id)?.clone();
        let adapter = device
            .driver
            .as_ref()
            .and_then(|driver| self.adapters.get(driver))
            .cloned();
        Some(DeviceSnapshot {
            state: self.states.get(device_id).cloned(),
            format: self.formats.get(device_id).cloned(),
            attributes: self.attributes.get(device_id).cloned(),
            adapter,
            device,
        })
    }
}

/// Single write entry point used by presentation layers and the MQTT bridge.
#[async_trait]
pub trait FieldWriter: Send + Sync {
    async fn write_field(&self, device_id: &str, field_id: u32, value: FieldValue) -> HubResult<bool>;
}

pub struct HubService {
    client: Arc<HubClient>,
    entity_type: EntityType,
    reconnect_interval: Duration,
    registry: RwLock<Registry>,
    events: broadcast::Sender<DeviceEvent>,
    reconnecting: AtomicBool,
    watching: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HubService {
    pub fn new(client: Arc<HubClient>) -> Arc<Self> {
        Self::with_options(client, EntityType::Zigbee, RECONNECT_INTERVAL)
    }

    pub fn with_options(
        client: Arc<HubClient>,
        entity_type: EntityType,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            client,
            entity_type,
            reconnect_interval,
            registry: RwLock::new(Registry::default()),
            events,
            reconnecting: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn client(&self) -> &Arc<HubClient> {
        &self.client
    }

    /// Connect and load devices. On failure the service stays up with no
    /// devices, keeps retrying in the background, and returns `false`.
    pub async fn setup(self: &Arc<Self>) -> bool {
        self.start_watcher();

        let result = async {
            self.client.connect().await?;
            self.load_devices().await
        }
        .await;

        match result {
            Ok(count) => {
                info!(count, "Hub service ready");
                true
            }
            Err(e) => {
                warn!("Initial hub connection failed: {}; retrying in background", e);
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Abort background tasks and close the link.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.watching.store(false, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        self.client.disconnect().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Run `listener` for every event from now on.
    pub fn add_update_listener<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Update listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    fn start_watcher(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = self.client.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Broadcast watcher lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(service) = weak.upgrade() else {
                    break;
                };
                match event {
                    LinkEvent::Broadcast(broadcast) => service.handle_broadcast(broadcast).await,
                    LinkEvent::ConnectionLost => {
                        service.emit(DeviceEvent::ConnectionLost);
                        service.schedule_reconnect();
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn handle_broadcast(&self, broadcast: Broadcast) {
        if broadcast.evt != events::OBJECT_UPDATE {
            debug!(evt = %broadcast.evt, "Forwarding broadcast");
            self.emit(DeviceEvent::Notification {
                event: broadcast.evt,
                payload: broadcast.raw,
            });
            return;
        }

        let Some(device_id) = broadcast.id else {
            debug!("object_update without device id");
            return;
        };

        let mut registry = self.registry.write().await;
        let Some(device) = registry.devices.get_mut(&device_id) else {
            debug!(device_id = %device_id, "Ignoring update for unknown device");
            return;
        };
        let description_changed = match broadcast.raw.as_object() {
            Some(raw) => device.merge(raw),
            None => false,
        };

        let fields = match &broadcast.props {
            Some(props) => registry
                .states
                .entry(device_id.clone())
                .or_insert_with(|| DeviceState::empty(device_id.clone()))
                .apply_props(props),
            None => Vec::new(),
        };
        drop(registry);

        if fields.is_empty() && !description_changed {
            return;
        }
        debug!(device_id = %device_id, ?fields, "Device updated");
        self.emit(DeviceEvent::StateChanged { device_id, fields });
    }

    /// Fetch the catalog and every device's state, format and attributes,
    /// plus adapters for drivers not seen before. Per-device failures are
    /// logged and skipped. Returns the device count.
    ///
    /// Each device's data is installed as soon as it is fetched, so
    /// broadcasts received while the rest of the catalog loads merge on top.
    pub async fn load_devices(&self) -> HubResult<usize> {
        let devices = self.client.list_devices(self.entity_type).await?;
        info!(count = devices.len(), "Loaded device list");

        {
            let mut registry = self.registry.write().await;
            registry.devices = devices.iter().map(|d| (d.id.clone(), d.clone())).collect();
            let Registry {
                devices,
                states,
                formats,
                attributes,
                ..
            } = &mut *registry;
            states.retain(|id, _| devices.contains_key(id));
            formats.retain(|id, _| devices.contains_key(id));
            attributes.retain(|id, _| devices.contains_key(id));
        }

        for device in &devices {
            let id = device.id.as_str();
            debug!(device_id = %id, model = %device.model, "Loading device");

            let state = self.client.get_state(id, self.entity_type, None).await;
            {
                let mut registry = self.registry.write().await;
                match state {
                    Ok(state) => {
                        registry.states.insert(device.id.clone(), state);
                    }
                    Err(e) => {
                        warn!(device_id = %id, "Failed to load state: {}", e);
                        registry.states.remove(id);
                    }
                }
            }

            let format = self.client.get_format(id, self.entity_type).await;
            {
                let mut registry = self.registry.write().await;
                match format {
                    Ok(format) => {
                        registry.formats.insert(device.id.clone(), format);
                    }
                    Err(e) => {
                        warn!(device_id = %id, "Failed to load format: {}", e);
                        registry.formats.remove(id);
                    }
                }
            }

            let attrs = self.client.get_attributes(id, self.entity_type).await;
            {
                let mut registry = self.registry.write().await;
                match attrs {
                    Ok(attrs) => {
                        registry.attributes.insert(device.id.clone(), attrs);
                    }
                    Err(e) => {
                        debug!(device_id = %id, "No attributes: {}", e);
                        registry.attributes.remove(id);
                    }
                }
            }

            let Some(driver) = device.driver.as_deref() else {
                continue;
            };
            if self.registry.read().await.adapters.contains_key(driver) {
                continue;
            }
            match self.client.get_adapter(driver).await {
                Ok(adapter) => {
                    debug!(driver, params = adapter.params.len(), "Loaded adapter");
                    self.registry
                        .write()
                        .await
                        .adapters
                        .insert(driver.to_string(), Arc::new(adapter));
                }
                Err(e) => warn!(driver, "Failed to load adapter: {}", e),
            }
        }

        self.emit(DeviceEvent::DevicesReloaded);
        Ok(devices.len())
    }

    /// Start the reconnect loop unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.reconnect_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(service) = weak.upgrade() else {
                    return;
                };
                info!("Attempting to reconnect to hub");
                match service.reconnect_once().await {
                    Ok(count) => {
                        info!(count, "Reconnected to hub");
                        service.reconnecting.store(false, Ordering::SeqCst);
                        // A loss reported before the flag cleared was not scheduled.
                        if service.client.is_connected()
                            || service.reconnecting.swap(true, Ordering::SeqCst)
                        {
                            return;
                        }
                        warn!("Hub link dropped while reloading; retrying in {:?}", interval);
                    }
                    Err(e) => warn!("Reconnect failed: {}; retrying in {:?}", e, interval),
                }
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn reconnect_once(&self) -> HubResult<usize> {
        self.client.disconnect().await;
        self.client.connect().await?;
        self.load_devices().await
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    // -- mutations -------------------------------------------------------------

    /// Write one raw field value. The value is coerced against the device's
    /// field format when one is known.
    pub async fn set_device_field(
        &self,
        device_id: &str,
        field_id: u32,
        value: FieldValue,
    ) -> HubResult<bool> {
        let format = {
            let registry = self.registry.read().await;
            if !registry.devices.contains_key(device_id) {
                return Err(HubError::UnknownDevice(device_id.to_string()));
            }
            registry
                .formats
                .get(device_id)
                .and_then(|f| f.field(field_id))
                .copied()
        };

        let value = match format {
            Some(format) => format
                .coerce(value)
                .map_err(|e| HubError::Parse(e.to_string()))?,
            None => value,
        };

        debug!(device_id, field_id, %value, "Setting field");
        self.client
            .set_state(device_id, self.entity_type, field_id, &value)
            .await
    }

    /// Store new user attributes on the hub and in the registry.
    pub async fn set_attributes(
        &self,
        device_id: &str,
        attributes: DeviceAttributes,
    ) -> HubResult<bool> {
        if !self.registry.read().await.devices.contains_key(device_id) {
            return Err(HubError::UnknownDevice(device_id.to_string()));
        }
        let accepted = self
            .client
            .set_attributes(device_id, self.entity_type, &attributes)
            .await?;
        if accepted {
            self.registry
                .write()
                .await
                .attributes
                .insert(device_id.to_string(), attributes);
            self.emit(DeviceEvent::AttributesChanged {
                device_id: device_id.to_string(),
            });
        }
        Ok(accepted)
    }

    // -- accessors -------------------------------------------------------------

    pub async fn devices(&self) -> Vec<DeviceDescription> {
        self.registry.read().await.devices.values().cloned().collect()
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceDescription> {
        self.registry.read().await.devices.get(device_id).cloned()
    }

    pub async fn state(&self, device_id: &str) -> Option<DeviceState> {
        self.registry.read().await.states.get(device_id).cloned()
    }

    pub async fn format(&self, device_id: &str) -> Option<DeviceFormat> {
        self.registry.read().await.formats.get(device_id).cloned()
    }

    pub async fn attributes(&self, device_id: &str) -> Option<DeviceAttributes> {
        self.registry.read().await.attributes.get(device_id).cloned()
    }

    pub async fn adapter(&self, driver: &str) -> Option<Arc<DeviceAdapter>> {
        self.registry.read().await.adapters.get(driver).cloned()
    }

    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.registry.read().await.snapshot(device_id)
    }

    /// Snapshots of every device, ordered by device id.
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let registry = self.registry.read().await;
        registry
            .devices
            .keys()
            .filter_map(|id| registry.snapshot(id))
            .collect()
    }
}

#[async_trait]
impl FieldWriter for HubService {
    async fn write_field(&self, device_id: &str, field_id: u32, value: FieldValue) -> HubResult<bool> {
        self.set_device_field(device_id, field_id, value).await
    }
}
