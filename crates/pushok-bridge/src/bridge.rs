//! MQTT side of the bridge.
//!
//! [`BridgeCore`] turns registry events into retained MQTT publications and
//! routes `<base>/<friendly>/set` messages back to the hub. [`MqttBridge`]
//! drives it from a `rumqttc` connection; the event loop is polled on its own
//! task so publishing never waits on itself.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pushok_hub::{DeviceEvent, DeviceSnapshot, FieldWriter, HubService};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::command::{self, FieldResult, SetCommand};
use crate::config::MqttConfig;
use crate::discovery::DiscoveryBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::naming::{NameIndex, friendly_name};
use crate::payload::{self, Topics};

const CLIENT_CAPACITY: usize = 64;
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// Outbound MQTT operations used by the bridge.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> BridgeResult<()>;
    async fn subscribe(&self, filter: &str) -> BridgeResult<()>;
}

/// Registry view the bridge reads from and writes through.
#[async_trait]
pub trait DeviceCatalog: FieldWriter {
    async fn snapshots(&self) -> Vec<DeviceSnapshot>;
    async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot>;
    fn events(&self) -> broadcast::Receiver<DeviceEvent>;
}

#[async_trait]
impl DeviceCatalog for HubService {
    async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        HubService::snapshots(self).await
    }

    async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        HubService::snapshot(self, device_id).await
    }

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.subscribe()
    }
}

/// `rumqttc` client that drops publications while the broker is unreachable.
/// Everything is republished on the next `ConnAck`.
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> BridgeResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            debug!(topic, "MQTT offline, dropping publication");
            return Ok(());
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> BridgeResult<()> {
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        Ok(())
    }
}

pub struct BridgeCore {
    catalog: Arc<dyn DeviceCatalog>,
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    discovery: Option<DiscoveryBuilder>,
    names: Mutex<NameIndex>,
}

impl BridgeCore {
    pub fn new(
        config: &MqttConfig,
        catalog: Arc<dyn DeviceCatalog>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let topics = Topics::new(config.base_topic.clone());
        let discovery = config.discovery_enabled.then(|| {
            DiscoveryBuilder::new(
                topics.clone(),
                config.discovery_prefix.clone(),
                config.service_field_cutoff,
            )
        });
        Self {
            catalog,
            publisher,
            topics,
            discovery,
            names: Mutex::new(NameIndex::new(config.device_prefix.clone())),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Full republication after every broker (re)connection.
    pub async fn on_connected(&self) -> BridgeResult<()> {
        self.publish_bridge_state(true).await?;
        self.publish_all().await?;
        self.publisher.subscribe(&self.topics.set_filter()).await?;
        Ok(())
    }

    /// React to one piece of broker traffic. Failures are logged.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Connected => {
                if let Err(e) = self.on_connected().await {
                    error!("Initial MQTT publication failed: {}", e);
                }
            }
            Inbound::Message { topic, payload } => match self.handle_message(&topic, &payload).await {
                Ok(results) if !results.is_empty() => {
                    let written = results.iter().filter(|r| r.is_written()).count();
                    debug!(topic = %topic, written, total = results.len(), "Set command applied");
                }
                Ok(_) => {}
                Err(e) => warn!(topic = %topic, "Set command rejected: {}", e),
            },
        }
    }

    pub async fn publish_bridge_state(&self, online: bool) -> BridgeResult<()> {
        self.publish_json(&self.topics.bridge_state(), &payload::bridge_state(online))
            .await
    }

    /// Device list, every device state and, when enabled, discovery.
    pub async fn publish_all(&self) -> BridgeResult<()> {
        let snapshots = self.catalog.snapshots().await;
        self.names.lock().rebuild(&snapshots);

        self.publish_device_list(&snapshots).await?;
        for snapshot in &snapshots {
            self.publish_device(snapshot).await?;
        }
        if self.discovery.is_some() {
            for snapshot in &snapshots {
                self.publish_discovery(snapshot).await?;
            }
            info!(count = snapshots.len(), "Published MQTT discovery");
        }
        Ok(())
    }

    pub async fn handle_event(&self, event: &DeviceEvent) -> BridgeResult<()> {
        match event {
            DeviceEvent::StateChanged { device_id, .. } => {
                self.refresh_names().await;
                if let Some(snapshot) = self.catalog.snapshot(device_id).await {
                    self.publish_device(&snapshot).await?;
                }
            }
            DeviceEvent::AttributesChanged { device_id } => {
                self.names.lock().invalidate();
                let snapshots = self.catalog.snapshots().await;
                self.names.lock().rebuild(&snapshots);
                self.publish_device_list(&snapshots).await?;
                if let Some(snapshot) = snapshots.iter().find(|s| &s.device.id == device_id) {
                    self.publish_device(snapshot).await?;
                    self.publish_discovery(snapshot).await?;
                }
            }
            DeviceEvent::DevicesReloaded => {
                self.names.lock().invalidate();
                self.publish_all().await?;
            }
            DeviceEvent::Notification { event, .. } => {
                debug!(event = %event, "Hub notification");
            }
            DeviceEvent::ConnectionLost => {
                warn!("Hub connection lost; device states will refresh after reconnect");
            }
        }
        Ok(())
    }

    /// Handle an inbound MQTT message. Only set topics are acted on.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> BridgeResult<Vec<FieldResult>> {
        let Some(friendly) = self.topics.parse_set(topic) else {
            debug!(topic, "Ignoring MQTT message");
            return Ok(Vec::new());
        };

        self.refresh_names().await;
        let device_id = self
            .names
            .lock()
            .resolve(friendly)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::UnknownDevice(friendly.to_string()))?;
        let command = SetCommand::parse(payload)?;
        let snapshot = self
            .catalog
            .snapshot(&device_id)
            .await
            .ok_or_else(|| BridgeError::UnknownDevice(device_id.clone()))?;

        debug!(device_id = %device_id, friendly, "Set command");
        Ok(command::apply(
            &*self.catalog,
            &device_id,
            snapshot.adapter.as_deref(),
            &command,
        )
        .await)
    }

    async fn refresh_names(&self) {
        if !self.names.lock().is_stale() {
            return;
        }
        let snapshots = self.catalog.snapshots().await;
        self.names.lock().rebuild(&snapshots);
    }

    fn friendly(&self, snapshot: &DeviceSnapshot) -> String {
        let names = self.names.lock();
        match names.name_of(&snapshot.device.id) {
            Some(name) => name.to_string(),
            None => friendly_name(names.prefix(), snapshot),
        }
    }

    async fn publish_device_list(&self, snapshots: &[DeviceSnapshot]) -> BridgeResult<()> {
        let list: Vec<Value> = snapshots
            .iter()
            .map(|s| payload::device_entry(s, &self.friendly(s)))
            .collect();
        self.publish_json(&self.topics.bridge_devices(), &Value::Array(list))
            .await
    }

    async fn publish_device(&self, snapshot: &DeviceSnapshot) -> BridgeResult<()> {
        let Some(state) = payload::device_state(snapshot) else {
            return Ok(());
        };
        let friendly = self.friendly(snapshot);
        self.publish_json(&self.topics.state(&friendly), &state).await?;
        self.publisher
            .publish(
                &self.topics.availability(&friendly),
                payload::availability(snapshot).as_bytes().to_vec(),
                true,
            )
            .await
    }

    async fn publish_discovery(&self, snapshot: &DeviceSnapshot) -> BridgeResult<()> {
        let Some(builder) = &self.discovery else {
            return Ok(());
        };
        let friendly = self.friendly(snapshot);
        for doc in builder.documents(snapshot, &friendly) {
            self.publish_json(&doc.topic, &doc.payload).await?;
        }
        Ok(())
    }

    async fn publish_json(&self, topic: &str, value: &Value) -> BridgeResult<()> {
        self.publisher
            .publish(topic, serde_json::to_vec(value)?, true)
            .await
    }
}

/// Broker traffic the bridge acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// ConnAck, first connection or any reconnection.
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

impl Inbound {
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => Some(Self::Connected),
            Event::Incoming(Packet::Publish(publish)) => Some(Self::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            }),
            _ => None,
        }
    }
}

pub struct MqttBridge {
    core: Arc<BridgeCore>,
    catalog: Arc<dyn DeviceCatalog>,
    client: AsyncClient,
    eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    reconnect_delay: Duration,
}

impl MqttBridge {
    pub fn new(config: &MqttConfig, catalog: Arc<dyn DeviceCatalog>) -> Self {
        let topics = Topics::new(config.base_topic.clone());

        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }
        let will = serde_json::to_vec(&payload::bridge_state(false)).unwrap_or_default();
        options.set_last_will(LastWill::new(
            topics.bridge_state(),
            will,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let publisher = Arc::new(MqttPublisher {
            client: client.clone(),
            connected: Arc::clone(&connected),
        });

        Self {
            core: Arc::new(BridgeCore::new(config, Arc::clone(&catalog), publisher)),
            catalog,
            client,
            eventloop,
            connected,
            reconnect_delay: config.reconnect_delay(),
        }
    }

    pub fn core(&self) -> &Arc<BridgeCore> {
        &self.core
    }

    /// Run until `shutdown` resolves, then publish `offline` and disconnect.
    pub async fn run<F>(self, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let MqttBridge {
            core,
            catalog,
            client,
            eventloop,
            connected,
            reconnect_delay,
        } = self;

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(poll_eventloop(
            eventloop,
            inbound_tx,
            Arc::clone(&connected),
            reconnect_delay,
        ));
        let mut events = catalog.events();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => core.handle_inbound(inbound).await,
                    None => {
                        error!("MQTT event loop stopped");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = core.handle_event(&event).await {
                            warn!("Failed to publish device update: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Device events lagged, republishing everything");
                        if let Err(e) = core.publish_all().await {
                            warn!("Republication failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Device event stream closed");
                        break;
                    }
                },
            }
        }

        info!("Stopping MQTT bridge");
        if connected.load(Ordering::SeqCst) {
            if let Err(e) = core.publish_bridge_state(false).await {
                warn!("Failed to publish offline state: {}", e);
            }
            if let Err(e) = client.disconnect().await {
                debug!("MQTT disconnect: {}", e);
            }
            if tokio::time::timeout(SHUTDOWN_FLUSH, poller).await.is_err() {
                debug!("MQTT event loop did not finish flushing");
            }
        } else {
            poller.abort();
        }
        Ok(())
    }
}

async fn poll_eventloop(
    mut eventloop: EventLoop,
    inbound: mpsc::UnboundedSender<Inbound>,
    connected: Arc<AtomicBool>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(event) => {
                let Some(message) = Inbound::from_event(&event) else {
                    continue;
                };
                if message == Inbound::Connected {
                    info!("Connected to MQTT broker");
                    connected.store(true, Ordering::SeqCst);
                }
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                error!("MQTT error: {}, reconnecting in {:?}", e, reconnect_delay);
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
