//! In-process hub for integration tests.
//!
//! Implements the server side of the handshake with real P-256 / AES-GCM and
//! a small in-memory device catalog, reached through the `Connector` seam.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use p256::PublicKey;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use parking_lot::Mutex;
use pushok_hub::{Connector, Frame, HubError, HubResult, TaskGuard, Transport};
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Per-connection handshake state.
struct Session {
    cipher: Aes256Gcm,
    client_key: VerifyingKey,
    dev_nonce: [u8; 32],
}

pub struct HubState {
    gateway: SigningKey,
    pub users: HashMap<String, Vec<u8>>,
    pub allow_registration: bool,
    pub corrupt_gateway_signature: bool,
    pub refuse_connections: bool,
    pub silent_methods: HashSet<String>,

    pub devices: Vec<Value>,
    pub states: HashMap<String, Value>,
    pub formats: HashMap<String, Value>,
    pub attributes: HashMap<String, Value>,
    pub adapters: HashMap<String, Value>,

    pub calls: HashMap<String, usize>,
    pub set_state_calls: Vec<Value>,
    pub connections: usize,

    session: Option<Session>,
    push: Option<mpsc::Sender<Frame>>,
    task: Option<AbortHandle>,
}

#[derive(Clone)]
pub struct FakeHub {
    pub state: Arc<Mutex<HubState>>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                gateway: SigningKey::random(&mut OsRng),
                users: HashMap::new(),
                allow_registration: true,
                corrupt_gateway_signature: false,
                refuse_connections: false,
                silent_methods: HashSet::new(),
                devices: Vec::new(),
                states: HashMap::new(),
                formats: HashMap::new(),
                attributes: HashMap::new(),
                adapters: HashMap::new(),
                calls: HashMap::new(),
                set_state_calls: Vec::new(),
                connections: 0,
                session: None,
                push: None,
                task: None,
            })),
        }
    }

    /// Two dimmers sharing the `dimmer` driver, plus a contact sensor.
    pub fn with_sample_devices() -> Self {
        let hub = Self::new();
        {
            let mut s = hub.state.lock();
            s.devices = vec![
                json!({"id": "00:aa", "mnf": "Pushok", "mdl": "D1", "drv": "dimmer", "lqi": 200}),
                json!({"id": "00:bb", "mnf": "Pushok", "mdl": "D1", "drv": "dimmer", "lqi": 180}),
                json!({"id": "00:cc", "mdl": "C1", "drv": "contact", "warn": true}),
            ];
            s.states.insert(
                "00:aa".into(),
                json!({"1": {"value": true}, "2": {"value": 255}, "adptr-crc": 11}),
            );
            s.states
                .insert("00:bb".into(), json!({"1": {"value": false}, "2": {"value": 0}}));
            s.states.insert("00:cc".into(), json!({"1": {"value": true}}));
            s.formats
                .insert("00:aa".into(), json!({"1": 0x0100, "2": 0x0101}));
            s.formats
                .insert("00:bb".into(), json!({"1": 0x0100, "2": 0x0101}));
            s.formats.insert("00:cc".into(), json!({"1": 0x0000}));
            s.attributes
                .insert("00:aa".into(), json!("{\"name\": \"Kitchen\"}"));
            s.adapters.insert(
                "dimmer".into(),
                json!({
                    "crc": 11,
                    "content": {
                        "description": "Dimmer",
                        "params": [
                            {"address": 1, "access": "rw", "type": "bool", "viewParams": {"name": "state"}},
                            {"address": 2, "access": "rw", "type": "int", "min": 0, "max": 100,
                             "viewParams": {"name": "brightness"},
                             "convert": {"conversion": ["self", 2.55, "/"], "inversion": ["self", 2.55, "*"]}}
                        ]
                    }
                }),
            );
            s.adapters.insert(
                "contact".into(),
                json!({
                    "crc": 5,
                    "content": "{\"params\": [{\"address\": 1, \"access\": \"r\", \"type\": \"bool\", \"viewParams\": {\"name\": \"contact\"}}]}"
                }),
            );
        }
        hub
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn register_user(&self, user_id_b64: &str, public_key: Vec<u8>) {
        self.state
            .lock()
            .users
            .insert(user_id_b64.to_string(), public_key);
    }

    /// Push a broadcast to the connected client.
    pub async fn broadcast(&self, body: Value) {
        let push = self.state.lock().push.clone();
        if let Some(push) = push {
            let _ = push
                .send(Frame::Text(json!({ "broadcast": body }).to_string()))
                .await;
        }
    }

    /// Simulate the socket dropping.
    pub fn drop_connection(&self) {
        let mut s = self.state.lock();
        s.push.take();
        s.session.take();
        if let Some(task) = s.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Connector for FakeHub {
    async fn connect(&self) -> HubResult<Transport> {
        if self.state.lock().refuse_connections {
            return Err(HubError::Transport("connection refused".to_string()));
        }

        let (client_tx, mut hub_rx) = mpsc::channel::<Frame>(64);
        let (hub_tx, client_rx) = mpsc::channel::<Frame>(64);

        let state = Arc::clone(&self.state);
        let reply_tx = hub_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = hub_rx.recv().await {
                let Frame::Text(text) = frame else {
                    continue;
                };
                let reply = handle_request(&state, &text);
                if let Some(reply) = reply {
                    if reply_tx.send(Frame::Text(reply)).await.is_err() {
                        break;
                    }
                }
            }
        });

        {
            let mut s = self.state.lock();
            s.connections += 1;
            s.session = None;
            s.push = Some(hub_tx);
            s.task = Some(task.abort_handle());
        }

        Ok(Transport {
            outgoing: client_tx,
            incoming: client_rx,
            guard: TaskGuard::new(vec![task]),
        })
    }
}

fn handle_request(state: &Mutex<HubState>, text: &str) -> Option<String> {
    let request: Value = serde_json::from_str(text).ok()?;
    let id = request["id"].as_u64()?;
    let method = request["m"].as_str()?.to_string();
    let params = request.get("p").cloned().unwrap_or(Value::Null);

    let mut s = state.lock();
    *s.calls.entry(method.clone()).or_insert(0) += 1;
    if s.silent_methods.contains(&method) {
        return None;
    }

    let outcome = s.dispatch(&method, &params);
    let reply = match outcome {
        Ok(result) => json!({"id": id, "result": result}),
        Err((code, msg)) => json!({"id": id, "error": code, "msg": msg}),
    };
    Some(reply.to_string())
}

type Outcome = Result<Value, (&'static str, String)>;

impl HubState {
    fn dispatch(&mut self, method: &str, params: &Value) -> Outcome {
        match method {
            "pubKey" => Ok(json!({
                "key": STANDARD.encode(self.gateway.verifying_key().to_encoded_point(false).as_bytes())
            })),
            "challenge" => self.challenge(params),
            "authenticate" => self.authenticate(params),
            "addUser" => self.add_user(params),
            "listObjects" => Ok(Value::Array(self.devices.clone())),
            "getState" => Ok(self.lookup(&self.states, params)),
            "getFormat" => Ok(self.lookup(&self.formats, params)),
            "getAttributes" => Ok(self.lookup(&self.attributes, params)),
            "getAdapter" => {
                let driver = params["drv"].as_str().unwrap_or_default();
                self.adapters
                    .get(driver)
                    .cloned()
                    .ok_or(("E_NOT_FOUND", format!("no adapter {}", driver)))
            }
            "setState" => {
                self.set_state_calls.push(params.clone());
                Ok(json!(true))
            }
            "setAttributes" => {
                let id = params["id"].as_str().unwrap_or_default().to_string();
                self.attributes.insert(id, params["attributes"].clone());
                Ok(json!(true))
            }
            other => Err(("E_METHOD", format!("unknown method {}", other))),
        }
    }

    fn lookup(&self, table: &HashMap<String, Value>, params: &Value) -> Value {
        let id = params["id"].as_str().unwrap_or_default();
        table.get(id).cloned().unwrap_or_else(|| json!({}))
    }

    fn challenge(&mut self, params: &Value) -> Outcome {
        let user_id = params["user_id"].as_str().unwrap_or_default();
        let mut dev_nonce = [0u8; 32];
        OsRng.fill_bytes(&mut dev_nonce);

        let Some(client_point) = self.users.get(user_id).cloned() else {
            // Unknown users get bytes nobody can open.
            let mut junk = vec![0u8; 48];
            OsRng.fill_bytes(&mut junk);
            self.session = None;
            return Ok(json!(STANDARD.encode(junk)));
        };

        let client = PublicKey::from_sec1_bytes(&client_point).map_err(|_| ("E_KEY", String::new()))?;
        let shared = p256::ecdh::diffie_hellman(self.gateway.as_nonzero_scalar(), client.as_affine());
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice())
            .map_err(|_| ("E_KEY", String::new()))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), dev_nonce.as_slice())
            .map_err(|_| ("E_CRYPTO", String::new()))?;

        self.session = Some(Session {
            cipher,
            client_key: VerifyingKey::from_sec1_bytes(&client_point)
                .map_err(|_| ("E_KEY", String::new()))?,
            dev_nonce,
        });
        Ok(json!(STANDARD.encode(sealed)))
    }

    fn authenticate(&mut self, params: &Value) -> Outcome {
        let denied = Ok(json!({"authorized": false}));
        let Some(session) = self.session.as_ref() else {
            return denied;
        };
        let Some(password) = params["password"].as_str().and_then(|p| STANDARD.decode(p).ok())
        else {
            return denied;
        };
        let iv = Nonce::from_slice(&session.dev_nonce[..12]);
        let Ok(plain) = session.cipher.decrypt(iv, password.as_slice()) else {
            return denied;
        };
        if plain.len() <= 32 {
            return denied;
        }
        let (der, user_nonce) = plain.split_at(plain.len() - 32);
        let Ok(signature) = Signature::from_der(der) else {
            return denied;
        };
        let mut message = session.dev_nonce.to_vec();
        message.extend_from_slice(user_nonce);
        if session.client_key.verify(&message, &signature).is_err() {
            return denied;
        }

        let signed: &[u8] = if self.corrupt_gateway_signature {
            b"not the user nonce"
        } else {
            user_nonce
        };
        let gateway_sig: Signature = self.gateway.sign(signed);
        let sealed = session
            .cipher
            .encrypt(iv, gateway_sig.to_der().as_bytes())
            .map_err(|_| ("E_CRYPTO", String::new()))?;

        Ok(json!({
            "authorized": true,
            "role": 1,
            "signature": STANDARD.encode(sealed),
        }))
    }

    fn add_user(&mut self, params: &Value) -> Outcome {
        if !self.allow_registration {
            return Err(("E_ACCESS", "registration closed".to_string()));
        }
        let user_id = params["user_id"].as_str().unwrap_or_default().to_string();
        let key = params["public_key"]
            .as_str()
            .and_then(|k| STANDARD.decode(k).ok())
            .ok_or(("E_ARGS", "bad public key".to_string()))?;
        self.users.insert(user_id, key);
        Ok(json!(true))
    }
}

/// Wait for a condition, polling.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
