//! Authenticated command/response link to one hub.
//!
//! One socket carries every command. Each [`HubClient::invoke`] registers a
//! pending slot keyed by a fresh request id and waits on it; the receive loop
//! completes slots by id in whatever order responses arrive, and fans
//! broadcasts out to subscribers without ever matching them to a request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::HubAuth;
use crate::error::{HandshakeError, HubError, HubResult};
use crate::models::{
    DeviceAdapter, DeviceAttributes, DeviceDescription, DeviceFormat, DeviceState,
};
use crate::protocol::{
    Broadcast, COMMAND_TIMEOUT, CLIENT_VERSION, EntityType, ErrorReply, Incoming, Request, Role,
    methods,
};
use crate::transport::{Connector, Frame, TaskGuard};
use crate::value::FieldValue;

const EVENT_CAPACITY: usize = 256;

/// What the link reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Broadcast(Broadcast),
    /// The socket went away while the link was up. Sent once per connection,
    /// never for an explicit [`HubClient::disconnect`].
    ConnectionLost,
}

type Reply = Result<Value, ErrorReply>;

/// State shared with the receive loop.
struct Shared {
    next_id: AtomicU64,
    /// Bumped on every connect and disconnect; a receive loop from an older
    /// connection must not touch the current one.
    generation: AtomicU64,
    connected: AtomicBool,
    authorized: AtomicBool,
    role: Mutex<Role>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    outgoing: Mutex<Option<mpsc::Sender<Frame>>>,
    events: broadcast::Sender<LinkEvent>,
}

impl Shared {
    fn complete(&self, id: u64, reply: Reply) {
        match self.pending.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.send(reply);
            }
            None => debug!(id, "Dropping response with no pending command"),
        }
    }

    /// Tear down after the receive loop ends on its own.
    fn connection_closed(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outgoing.lock().take();
        self.pending.lock().clear();
        self.authorized.store(false, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Connection to hub lost");
            let _ = self.events.send(LinkEvent::ConnectionLost);
        }
    }
}

/// Removes its pending slot when the waiting invoke finishes, however it finishes.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Client for the hub RPC surface.
pub struct HubClient {
    connector: Arc<dyn Connector>,
    auth: Mutex<HubAuth>,
    shared: Arc<Shared>,
    command_timeout: Duration,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    transport_guard: Mutex<Option<TaskGuard>>,
}

impl HubClient {
    pub fn new(connector: Arc<dyn Connector>, auth: HubAuth) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            auth: Mutex::new(auth),
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                authorized: AtomicBool::new(false),
                role: Mutex::new(Role::Guest),
                pending: Mutex::new(HashMap::new()),
                outgoing: Mutex::new(None),
                events,
            }),
            command_timeout: COMMAND_TIMEOUT,
            receive_task: Mutex::new(None),
            transport_guard: Mutex::new(None),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_authorized(&self) -> bool {
        self.shared.authorized.load(Ordering::SeqCst)
    }

    /// Role granted by the last successful authentication.
    pub fn role(&self) -> Role {
        *self.shared.role.lock()
    }

    /// Persistable identity: `(private key hex, user id base64)`.
    pub fn identity(&self) -> (String, String) {
        let auth = self.auth.lock();
        (auth.private_key_hex(), auth.user_id_b64())
    }

    /// Receive broadcasts and connection-lost notices.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Open the transport, start the receive loop and authenticate.
    ///
    /// Any failure leaves the client disconnected.
    pub async fn connect(&self) -> HubResult<()> {
        self.disconnect().await;

        let transport = self.connector.connect().await?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.shared.outgoing.lock() = Some(transport.outgoing);
        *self.transport_guard.lock() = Some(transport.guard);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let mut incoming = transport.incoming;
        let task = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                Self::dispatch(&shared, frame);
            }
            shared.connection_closed(generation);
        });
        *self.receive_task.lock() = Some(task);

        match self.authenticate().await {
            Ok(role) => {
                *self.shared.role.lock() = role;
                self.shared.authorized.store(true, Ordering::SeqCst);
                info!(?role, "Connected and authenticated to hub");
                Ok(())
            }
            Err(e) => {
                warn!("Hub authentication failed: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Stop the receive loop, close the socket and fail every pending command.
    pub async fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.authorized.store(false, Ordering::SeqCst);

        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
        self.shared.outgoing.lock().take();
        self.transport_guard.lock().take();

        let failed: Vec<_> = self.shared.pending.lock().drain().collect();
        if !failed.is_empty() {
            debug!(count = failed.len(), "Failing pending commands on disconnect");
        }
    }

    fn dispatch(shared: &Shared, frame: Frame) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                debug!(len = data.len(), "Ignoring binary frame");
                return;
            }
        };

        match Incoming::parse(&text) {
            Ok(Incoming::Broadcast(broadcast)) => {
                debug!(evt = %broadcast.evt, "Broadcast received");
                let _ = shared.events.send(LinkEvent::Broadcast(broadcast));
            }
            Ok(Incoming::Response { id, outcome }) => shared.complete(id, outcome),
            Ok(Incoming::Other) => debug!("Ignoring frame without id"),
            Err(e) => {
                let preview: String = text.chars().take(100).collect();
                warn!("Invalid frame from hub ({}): {}", e, preview);
            }
        }
    }

    /// Send one command and wait for its response.
    pub async fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> HubResult<Value> {
        let sender = self
            .shared
            .outgoing
            .lock()
            .clone()
            .ok_or(HubError::NotConnected)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let _slot = PendingSlot {
            shared: &self.shared,
            id,
        };

        let text = Request {
            id,
            m: method,
            p: params.as_ref(),
        }
        .to_text()?;
        debug!(id, method, "Sending command");
        sender
            .send(Frame::Text(text))
            .await
            .map_err(|_| HubError::Disconnected {
                method: method.to_string(),
            })?;
        drop(sender);

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(HubError::Timeout {
                method: method.to_string(),
            }),
            Ok(Err(_)) => Err(HubError::Disconnected {
                method: method.to_string(),
            }),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(reply))) => Err(HubError::Command {
                method: method.to_string(),
                code: reply.code,
                message: reply.message,
            }),
        }
    }

    /// [`HubClient::invoke`] with the configured command timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> HubResult<Value> {
        self.invoke(method, params, self.command_timeout).await
    }

    // -- handshake -------------------------------------------------------------

    async fn authenticate(&self) -> HubResult<Role> {
        let mut registered = false;
        loop {
            match self.login().await {
                Ok(role) => return Ok(role),
                Err(HubError::Handshake(
                    reason @ (HandshakeError::UnknownUser | HandshakeError::Rejected(_)),
                )) if !registered => {
                    debug!("Login failed ({}), attempting self-registration", reason);
                    self.register().await?;
                    registered = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn login(&self) -> HubResult<Role> {
        let result = self.call(methods::PUB_KEY, None).await?;
        let key = decode_b64_field(&result, "key")?;
        self.auth.lock().set_gateway_public_key(&key)?;

        let user_id = self.auth.lock().user_id_b64();
        let result = self
            .call(methods::CHALLENGE, Some(json!({ "user_id": user_id })))
            .await?;
        let challenge = decode_b64(&result)?;
        self.auth.lock().decrypt_challenge(&challenge)?;

        let payload = self.auth.lock().create_auth_payload()?;
        let result = self
            .call(
                methods::AUTHENTICATE,
                Some(json!({
                    "password": STANDARD.encode(payload),
                    "version": CLIENT_VERSION,
                })),
            )
            .await?;

        if !result.get("authorized").and_then(Value::as_bool).unwrap_or(false) {
            return Err(HandshakeError::Rejected("not authorized".to_string()).into());
        }

        if result.get("signature").is_some_and(|s| !s.is_null()) {
            let signature = decode_b64_field(&result, "signature")?;
            if !self.auth.lock().verify_gateway_response(&signature)? {
                return Err(HandshakeError::Rejected("gateway signature invalid".to_string()).into());
            }
            debug!("Gateway signature verified");
        }

        let role = Role::from_wire(result.get("role").and_then(Value::as_i64).unwrap_or(0));
        debug!(?role, "Authentication successful");
        Ok(role)
    }

    async fn register(&self) -> HubResult<()> {
        let (user_id, public_key) = {
            let auth = self.auth.lock();
            (auth.user_id_b64(), auth.public_key_b64())
        };
        let result = self
            .call(
                methods::ADD_USER,
                Some(json!({
                    "user_id": user_id,
                    "public_key": public_key,
                    "role": Role::Admin.to_wire(),
                })),
            )
            .await
            .map_err(|e| match e {
                HubError::Command { code, message, .. } => HubError::Handshake(
                    HandshakeError::Rejected(format!("registration refused: {}: {}", code, message)),
                ),
                other => other,
            })?;

        if is_truthy(&result) {
            info!("Registered with hub, re-authenticating");
            Ok(())
        } else {
            Err(HandshakeError::Rejected("registration refused".to_string()).into())
        }
    }

    // -- typed commands --------------------------------------------------------

    pub async fn list_devices(&self, entity_type: EntityType) -> HubResult<Vec<DeviceDescription>> {
        let result = self
            .call(methods::LIST_OBJECTS, Some(json!({ "type": entity_type.as_str() })))
            .await?;
        let Value::Array(items) = result else {
            return Err(HubError::Parse("listObjects result is not an array".to_string()));
        };

        let mut devices = Vec::with_capacity(items.len());
        for item in &items {
            match DeviceDescription::from_json(item) {
                Ok(device) => devices.push(device),
                Err(e) => warn!("Skipping device entry: {}", e),
            }
        }
        Ok(devices)
    }

    pub async fn get_state(
        &self,
        device_id: &str,
        entity_type: EntityType,
        fields: Option<&[u32]>,
    ) -> HubResult<DeviceState> {
        let mut params = json!({ "id": device_id, "type": entity_type.as_str() });
        if let Some(fields) = fields.filter(|f| !f.is_empty()) {
            params["fields"] = json!(fields);
        }
        let result = self.call(methods::GET_STATE, Some(params)).await?;
        Ok(DeviceState::from_json(device_id, &result))
    }

    pub async fn set_state(
        &self,
        device_id: &str,
        entity_type: EntityType,
        field: u32,
        value: &FieldValue,
    ) -> HubResult<bool> {
        let result = self
            .call(
                methods::SET_STATE,
                Some(json!({
                    "id": device_id,
                    "type": entity_type.as_str(),
                    "field": field,
                    "value": value.to_json(),
                })),
            )
            .await?;
        Ok(is_truthy(&result))
    }

    pub async fn get_attributes(
        &self,
        device_id: &str,
        entity_type: EntityType,
    ) -> HubResult<DeviceAttributes> {
        let result = self
            .call(
                methods::GET_ATTRIBUTES,
                Some(json!({ "id": device_id, "type": entity_type.as_str() })),
            )
            .await?;
        Ok(DeviceAttributes::from_json(&result))
    }

    pub async fn set_attributes(
        &self,
        device_id: &str,
        entity_type: EntityType,
        attributes: &DeviceAttributes,
    ) -> HubResult<bool> {
        let result = self
            .call(
                methods::SET_ATTRIBUTES,
                Some(json!({
                    "id": device_id,
                    "type": entity_type.as_str(),
                    "attributes": attributes.to_json(),
                })),
            )
            .await?;
        Ok(is_truthy(&result))
    }

    pub async fn get_format(&self, device_id: &str, entity_type: EntityType) -> HubResult<DeviceFormat> {
        let result = self
            .call(
                methods::GET_FORMAT,
                Some(json!({ "id": device_id, "type": entity_type.as_str() })),
            )
            .await?;
        Ok(DeviceFormat::from_json(device_id, &result))
    }

    pub async fn get_adapter(&self, driver: &str) -> HubResult<DeviceAdapter> {
        let result = self
            .call(methods::GET_ADAPTER, Some(json!({ "drv": driver })))
            .await?;
        DeviceAdapter::from_response(driver, &result)
            .map_err(|e| HubError::Parse(format!("adapter {}: {}", driver, e)))
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
    }
}

fn decode_b64(value: &Value) -> HubResult<Vec<u8>> {
    let text = value.as_str().ok_or_else(|| {
        HubError::from(HandshakeError::Protocol(format!("expected base64 string, got {}", value)))
    })?;
    STANDARD
        .decode(text)
        .map_err(|e| HandshakeError::Protocol(format!("invalid base64: {}", e)).into())
}

fn decode_b64_field(result: &Value, key: &str) -> HubResult<Vec<u8>> {
    match result.get(key) {
        Some(value) => decode_b64(value),
        None => Err(HandshakeError::Protocol(format!("missing '{}' in result", key)).into()),
    }
}

/// Hub results are loosely typed; anything but `false`, `null`, `0` or `""` counts as success.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;

    /// Hands out one pre-built transport and keeps the hub-side ends.
    struct LoopbackConnector {
        transport: Mutex<Option<Transport>>,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self) -> HubResult<Transport> {
            self.transport
                .lock()
                .take()
                .ok_or_else(|| HubError::Transport("refused".to_string()))
        }
    }

    /// Client wired to raw channels, marked connected without a handshake.
    async fn raw_client() -> (HubClient, mpsc::Receiver<Frame>, mpsc::Sender<Frame>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let client = HubClient::new(
            Arc::new(LoopbackConnector {
                transport: Mutex::new(None),
            }),
            HubAuth::generate(),
        );

        let generation = client.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *client.shared.outgoing.lock() = Some(out_tx);
        client.shared.connected.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&client.shared);
        let mut incoming = in_rx;
        *client.receive_task.lock() = Some(tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                HubClient::dispatch(&shared, frame);
            }
            shared.connection_closed(generation);
        }));

        (client, out_rx, in_tx)
    }

    fn request_id(frame: Frame) -> u64 {
        let Frame::Text(text) = frame else {
            panic!("expected text frame");
        };
        serde_json::from_str::<Value>(&text).unwrap()["id"]
            .as_u64()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_without_connection() {
        let client = HubClient::new(
            Arc::new(LoopbackConnector {
                transport: Mutex::new(None),
            }),
            HubAuth::generate(),
        );
        let err = client.call(methods::PUB_KEY, None).await.unwrap_err();
        assert!(matches!(err, HubError::NotConnected));
        assert!(matches!(client.connect().await, Err(HubError::Transport(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (client, mut hub_rx, hub_tx) = raw_client().await;
        let client = Arc::new(client);

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("first", None).await }
        });
        let id_first = request_id(hub_rx.recv().await.unwrap());
        let second = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("second", None).await }
        });
        let id_second = request_id(hub_rx.recv().await.unwrap());
        assert!(id_second > id_first);

        hub_tx
            .send(Frame::Text(format!(r#"{{"id": {}, "result": "b"}}"#, id_second)))
            .await
            .unwrap();
        hub_tx
            .send(Frame::Text(format!(r#"{{"id": {}, "result": "a"}}"#, id_first)))
            .await
            .unwrap();

        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert!(client.shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let (client, mut hub_rx, hub_tx) = raw_client().await;
        let client = Arc::new(client);
        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call(methods::SET_STATE, None).await }
        });
        let id = request_id(hub_rx.recv().await.unwrap());
        hub_tx
            .send(Frame::Text(format!(
                r#"{{"id": {}, "error": "E_ACCESS", "msg": "read only"}}"#,
                id
            )))
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(HubError::Command { code, message, .. }) => {
                assert_eq!(code, "E_ACCESS");
                assert_eq!(message, "read only");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(client.shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_ignored() {
        let (client, mut hub_rx, hub_tx) = raw_client().await;
        let mut events = client.subscribe();

        let err = client
            .invoke("slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(client.shared.pending.lock().is_empty());

        let id = request_id(hub_rx.recv().await.unwrap());
        hub_tx
            .send(Frame::Text(format!(r#"{{"id": {}, "result": 1}}"#, id)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(client.shared.pending.lock().is_empty());
        assert!(client.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_not_matched_to_request() {
        let (client, mut hub_rx, hub_tx) = raw_client().await;
        let client = Arc::new(client);
        let mut events = client.subscribe();

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("getState", None).await }
        });
        let id = request_id(hub_rx.recv().await.unwrap());

        // A broadcast carrying the same id must not complete the command.
        hub_tx
            .send(Frame::Text(format!(
                r#"{{"id": {}, "broadcast": {{"evt": "notification"}}}}"#,
                id
            )))
            .await
            .unwrap();
        hub_tx.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
        hub_tx
            .send(Frame::Text(format!(r#"{{"id": {}, "result": 7}}"#, id)))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!(7));
        match events.recv().await.unwrap() {
            LinkEvent::Broadcast(b) => assert_eq!(b.evt, "notification"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending_and_notifies_once() {
        let (client, mut hub_rx, hub_tx) = raw_client().await;
        let client = Arc::new(client);
        let mut events = client.subscribe();

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("listObjects", None).await }
        });
        let _ = hub_rx.recv().await.unwrap();
        drop(hub_tx);

        assert!(matches!(
            call.await.unwrap(),
            Err(HubError::Disconnected { .. })
        ));
        assert_eq!(events.recv().await.unwrap(), LinkEvent::ConnectionLost);
        assert!(!client.is_connected());

        client.disconnect().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_explicit_disconnect_is_silent() {
        let (client, mut hub_rx, _hub_tx) = raw_client().await;
        let client = Arc::new(client);
        let mut events = client.subscribe();

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("getFormat", None).await }
        });
        let _ = hub_rx.recv().await.unwrap();
        client.disconnect().await;

        assert!(matches!(
            call.await.unwrap(),
            Err(HubError::Disconnected { .. })
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!({"ok": 1})));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&Value::Null));
    }
}
