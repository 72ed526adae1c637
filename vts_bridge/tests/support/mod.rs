#![allow(dead_code)]

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use url::Url;
use vts_bridge::{
    AuthError, Bridge, BridgeConfig, BridgeDeps, BridgeSettings, Catalog, ConnectionState,
    Credential, InMemoryRegistry, MemoryConfigStore, RequestError, Session, SessionEvent,
    Transport, TransportError,
};
use vts_protocol::{
    ApiRequest, AvailableModel, AvailableModelsRequest, AvailableModelsResponse,
    CurrentModelRequest, CurrentModelResponse, Hotkey, HotkeyTriggerRequest,
    HotkeyTriggerResponse, HotkeysInCurrentModelRequest, HotkeysInCurrentModelResponse,
    ModelLoadRequest, ModelLoadResponse, StatisticsRequest, StatisticsResponse,
};

pub const WAIT: Duration = Duration::from_secs(3);

/// Gate name for the interactive token exchange in `FakeDevice::hold`.
pub const TOKEN_EXCHANGE: &str = "AuthenticationTokenRequest";

#[derive(Default)]
struct FakeState {
    models: Vec<(String, String)>,
    hotkeys: HashMap<String, Vec<(String, String)>>,
    current: Option<String>,
    valid_tokens: HashSet<String>,
    issued: Vec<String>,
    deny_tokens: bool,
    refuse_connect: bool,
    failing: HashSet<String>,
    gates: HashMap<String, Arc<Semaphore>>,
    sessions: Vec<Arc<FakeSession>>,
    triggered: Vec<String>,
}

/// Scripted device behind `FakeTransport`. Everything happens in memory.
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn demo() -> Self {
        let device = Self::default();
        {
            let mut s = device.lock();
            s.models = vec![
                ("m-bravo".to_string(), "Bravo".to_string()),
                ("m-alpha".to_string(), "alpha".to_string()),
            ];
            s.hotkeys.insert(
                "m-bravo".to_string(),
                vec![
                    ("hk-wave".to_string(), "Wave".to_string()),
                    ("hk-blush".to_string(), "blush".to_string()),
                ],
            );
            s.hotkeys.insert(
                "m-alpha".to_string(),
                vec![("hk-angry".to_string(), "Angry".to_string())],
            );
            s.current = Some("m-bravo".to_string());
        }
        device
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            device: self.clone(),
        })
    }

    /// Requests of this type wait until `release`.
    pub fn hold(&self, message_type: &str) {
        self.lock()
            .gates
            .insert(message_type.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, message_type: &str) {
        if let Some(gate) = self.lock().gates.remove(message_type) {
            gate.close();
        }
    }

    pub fn fail(&self, message_type: &str) {
        self.lock().failing.insert(message_type.to_string());
    }

    pub fn grant_token(&self, token: &str) {
        self.lock().valid_tokens.insert(token.to_string());
    }

    pub fn deny_token_requests(&self, deny: bool) {
        self.lock().deny_tokens = deny;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    pub fn issued_tokens(&self) -> Vec<String> {
        self.lock().issued.clone()
    }

    pub fn connections(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn triggered(&self) -> Vec<String> {
        self.lock().triggered.clone()
    }

    fn latest_session(&self) -> Option<Arc<FakeSession>> {
        self.lock().sessions.last().cloned()
    }

    /// Simulates the device going away under the current session.
    pub fn drop_connection(&self) {
        if let Some(session) = self.latest_session() {
            session.close("device went away");
        }
    }

    pub fn push_error(&self, id: i32, message: &str) {
        if let Some(session) = self.latest_session() {
            let _ = session.events_tx.send(SessionEvent::Error {
                id,
                message: message.to_string(),
            });
        }
    }

    async fn pass_gate(&self, message_type: &str) {
        let gate = self.lock().gates.get(message_type).cloned();
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }
    }

    fn answer(&self, message_type: &str, data: Value) -> Result<Value, RequestError> {
        let mut s = self.lock();
        if s.failing.contains(message_type) {
            return Err(RequestError::Api {
                id: 0,
                message: "simulated failure".to_string(),
            });
        }
        match message_type {
            StatisticsRequest::MESSAGE_TYPE => to_data(&StatisticsResponse {
                vtube_studio_version: "1.28.15".to_string(),
                uptime: 0,
                framerate: 60,
                allowed_plugins: 1,
                connected_plugins: 1,
            }),
            CurrentModelRequest::MESSAGE_TYPE => {
                let current = s.current.clone().and_then(|id| {
                    s.models.iter().find(|(m, _)| *m == id).cloned()
                });
                to_data(&CurrentModelResponse {
                    model_loaded: current.is_some(),
                    model_name: current.as_ref().map(|(_, n)| n.clone()).unwrap_or_default(),
                    model_id: current.map(|(id, _)| id).unwrap_or_default(),
                })
            }
            AvailableModelsRequest::MESSAGE_TYPE => {
                let available_models: Vec<AvailableModel> = s
                    .models
                    .iter()
                    .map(|(id, name)| AvailableModel {
                        model_loaded: s.current.as_deref() == Some(id.as_str()),
                        model_name: name.clone(),
                        model_id: id.clone(),
                        vts_model_name: String::new(),
                        vts_model_icon_name: String::new(),
                    })
                    .collect();
                to_data(&AvailableModelsResponse {
                    number_of_models: available_models.len() as i32,
                    available_models,
                })
            }
            HotkeysInCurrentModelRequest::MESSAGE_TYPE => {
                let model_id = s.current.clone().unwrap_or_default();
                let hotkeys = s.hotkeys.get(&model_id).cloned().unwrap_or_default();
                to_data(&HotkeysInCurrentModelResponse {
                    model_loaded: s.current.is_some(),
                    model_name: String::new(),
                    model_id,
                    available_hotkeys: hotkeys
                        .into_iter()
                        .map(|(id, name)| Hotkey {
                            name,
                            hotkey_type: "ToggleExpression".to_string(),
                            description: String::new(),
                            file: String::new(),
                            hotkey_id: id,
                            key_combination: Vec::new(),
                            on_screen_button_id: -1,
                        })
                        .collect(),
                })
            }
            ModelLoadRequest::MESSAGE_TYPE => {
                let request: ModelLoadRequest =
                    serde_json::from_value(data).map_err(RequestError::Decode)?;
                if !s.models.iter().any(|(id, _)| *id == request.model_id) {
                    return Err(RequestError::Api {
                        id: 153,
                        message: "No model with this ID found.".to_string(),
                    });
                }
                s.current = Some(request.model_id.clone());
                to_data(&ModelLoadResponse {
                    model_id: request.model_id,
                })
            }
            HotkeyTriggerRequest::MESSAGE_TYPE => {
                let request: HotkeyTriggerRequest =
                    serde_json::from_value(data).map_err(RequestError::Decode)?;
                s.triggered.push(request.hotkey_id.clone());
                to_data(&HotkeyTriggerResponse {
                    hotkey_id: request.hotkey_id,
                })
            }
            other => Err(RequestError::Api {
                id: 5,
                message: format!("unknown message type: {other}"),
            }),
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, RequestError> {
    serde_json::to_value(value).map_err(|e| RequestError::Transport(TransportError::Codec(e)))
}

pub struct FakeTransport {
    device: FakeDevice,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _url: &Url) -> Result<Arc<dyn Session>, TransportError> {
        if self.device.lock().refuse_connect {
            return Err(TransportError::Closed);
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession {
            device: self.device.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        });
        self.device.lock().sessions.push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct FakeSession {
    device: FakeDevice,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    closed: AtomicBool,
}

impl FakeSession {
    fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(SessionEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn authenticate(&self, credential: Option<&Credential>) -> Result<Credential, AuthError> {
        let credential = match credential {
            Some(c) => c.clone(),
            None => {
                self.device.pass_gate(TOKEN_EXCHANGE).await;
                if self.closed.load(Ordering::SeqCst) {
                    return Err(AuthError::Transport(TransportError::Closed));
                }
                let mut s = self.device.lock();
                if s.deny_tokens {
                    return Err(AuthError::Denied(
                        "User has denied API access for your plugin.".to_string(),
                    ));
                }
                let token = format!("token-{}", s.issued.len() + 1);
                s.valid_tokens.insert(token.clone());
                s.issued.push(token.clone());
                Credential::new(token)
            }
        };
        if self.device.lock().valid_tokens.contains(credential.as_str()) {
            Ok(credential)
        } else {
            Err(AuthError::Rejected("Token invalid.".to_string()))
        }
    }

    async fn request(&self, message_type: &str, data: Value) -> Result<Value, RequestError> {
        self.device.pass_gate(message_type).await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }
        self.device.answer(message_type, data)
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn disconnect(&self) {
        self.close("client disconnect");
    }
}

pub struct Harness {
    pub bridge: Bridge,
    pub device: FakeDevice,
    pub config: Arc<MemoryConfigStore>,
    pub registry: Arc<InMemoryRegistry>,
}

pub fn harness(device: FakeDevice, config: BridgeConfig) -> Harness {
    let settings: BridgeSettings = config.bridge.clone();
    let config = Arc::new(MemoryConfigStore::new(config));
    let registry = Arc::new(InMemoryRegistry::new());
    let (bridge, _task) = Bridge::spawn(BridgeDeps {
        transport: device.transport(),
        config: config.clone(),
        commands: registry.clone(),
        status: registry.clone(),
        settings,
    });
    Harness {
        bridge,
        device,
        config,
        registry,
    }
}

pub async fn wait_for_state(bridge: &Bridge, state: ConnectionState) {
    let mut rx = bridge.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("bridge stopped");
}

pub async fn wait_for_catalog(bridge: &Bridge, what: &str, pred: impl FnMut(&Catalog) -> bool) -> Catalog {
    let mut rx = bridge.watch_catalog();
    let catalog = tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("bridge stopped")
        .clone();
    catalog
}

/// Waits until every catalog kind has been fetched.
pub async fn wait_for_sync(bridge: &Bridge) -> Catalog {
    wait_for_catalog(bridge, "initial catalog sync", |c| !c.is_stale()).await
}

pub fn labels(registry: &InMemoryRegistry, command_id: &str) -> Vec<String> {
    registry
        .command(command_id)
        .unwrap_or_else(|| panic!("command {command_id} not published"))
        .choices
        .into_iter()
        .map(|c| c.label)
        .collect()
}
