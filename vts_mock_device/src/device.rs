use crate::protocol::{error_id, ApiEnvelope, ApiRequest, Hotkey, InboundMsg, OutboundMsg};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use vts_protocol::{
    AuthenticationRequest, AuthenticationResponse, AuthenticationTokenRequest,
    AuthenticationTokenResponse, AvailableModel, AvailableModelsRequest, AvailableModelsResponse,
    CurrentModelRequest, CurrentModelResponse, HotkeyTriggerRequest, HotkeyTriggerResponse,
    HotkeysInCurrentModelRequest, HotkeysInCurrentModelResponse, ModelLoadRequest,
    ModelLoadResponse, StatisticsRequest, StatisticsResponse, API_NAME,
};

const TOKEN_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct MockModel {
    pub id: String,
    pub name: String,
    pub hotkeys: Vec<Hotkey>,
}

impl MockModel {
    pub fn new(id: &str, name: &str, hotkeys: &[(&str, &str)]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            hotkeys: hotkeys
                .iter()
                .map(|(hotkey_id, hotkey_name)| Hotkey {
                    name: hotkey_name.to_string(),
                    hotkey_type: "ToggleExpression".to_string(),
                    description: String::new(),
                    file: String::new(),
                    hotkey_id: hotkey_id.to_string(),
                    key_combination: Vec::new(),
                    on_screen_button_id: -1,
                })
                .collect(),
        }
    }
}

/// Everything the fake device knows. Tests reach it through `DeviceControl`.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub version: String,
    pub models: Vec<MockModel>,
    pub current_model: Option<String>,
    pub valid_tokens: HashSet<String>,
    pub issued_tokens: Vec<String>,
    pub deny_token_requests: bool,
    /// Per message type response delay.
    pub delays: HashMap<String, Duration>,
    /// Message types that answer with an internal error instead of data.
    pub failing: HashSet<String>,
    pub request_log: Vec<String>,
    pub triggered_hotkeys: Vec<String>,
}

impl DeviceState {
    pub fn demo() -> Self {
        Self {
            version: "1.28.15".to_string(),
            models: vec![
                MockModel::new("m-bravo", "Bravo", &[("hk-wave", "Wave"), ("hk-blush", "blush")]),
                MockModel::new("m-alpha", "alpha", &[("hk-angry", "Angry")]),
                MockModel::new("m-charlie", "Charlie", &[]),
            ],
            current_model: Some("m-bravo".to_string()),
            ..Self::default()
        }
    }

    fn model(&self, id: &str) -> Option<&MockModel> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// Request handling half of the fake device; ticked from its own thread.
pub struct DeviceLoop {
    inbound_rx: Receiver<InboundMsg>,
    outbound_tx: Sender<OutboundMsg>,
    state: Arc<Mutex<DeviceState>>,

    client_authenticated: bool,
    delayed: Vec<(Instant, ApiEnvelope)>,
}

impl DeviceLoop {
    pub fn new(
        inbound_rx: Receiver<InboundMsg>,
        outbound_tx: Sender<OutboundMsg>,
        state: Arc<Mutex<DeviceState>>,
    ) -> Self {
        Self {
            inbound_rx,
            outbound_tx,
            state,
            client_authenticated: false,
            delayed: Vec::new(),
        }
    }

    pub fn tick(&mut self) {
        loop {
            match self.inbound_rx.try_recv() {
                Ok(InboundMsg::ClientConnected { .. }) => {
                    self.client_authenticated = false;
                    self.delayed.clear();
                }
                Ok(InboundMsg::ClientDisconnected) => {
                    self.client_authenticated = false;
                    self.delayed.clear();
                }
                Ok(InboundMsg::Request { envelope }) => {
                    let (response, delay) = self.handle(envelope);
                    match delay {
                        Some(d) => self.delayed.push((Instant::now() + d, response)),
                        None => self.send(response),
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        for (_, envelope) in due {
            self.send(envelope);
        }
    }

    fn handle(&mut self, request: ApiEnvelope) -> (ApiEnvelope, Option<Duration>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.request_log.push(request.message_type.clone());
        let delay = state.delays.get(&request.message_type).copied();
        let id = request.request_id.clone();

        if request.api_name != API_NAME {
            return (error(&id, error_id::INTERNAL_SERVER_ERROR, "unknown api name"), delay);
        }
        if state.failing.contains(&request.message_type) {
            return (
                error(&id, error_id::INTERNAL_SERVER_ERROR, "simulated failure"),
                delay,
            );
        }

        let response = match request.message_type.as_str() {
            AuthenticationTokenRequest::MESSAGE_TYPE => {
                match decode::<AuthenticationTokenRequest>(&request) {
                    Err(e) => e,
                    Ok(_) if state.deny_token_requests => error(
                        &id,
                        error_id::TOKEN_REQUEST_DENIED,
                        "User has denied API access for your plugin.",
                    ),
                    Ok(_) => {
                        let token: String = thread_rng()
                            .sample_iter(&Alphanumeric)
                            .take(TOKEN_LEN)
                            .map(char::from)
                            .collect();
                        state.valid_tokens.insert(token.clone());
                        state.issued_tokens.push(token.clone());
                        respond::<AuthenticationTokenRequest>(
                            &id,
                            AuthenticationTokenResponse {
                                authentication_token: token,
                            },
                        )
                    }
                }
            }
            AuthenticationRequest::MESSAGE_TYPE => match decode::<AuthenticationRequest>(&request) {
                Err(e) => e,
                Ok(req) => {
                    let authenticated = state.valid_tokens.contains(&req.authentication_token);
                    self.client_authenticated = authenticated;
                    let reason = if authenticated {
                        "Token valid. The plugin is authenticated for the duration of this session."
                    } else {
                        "Token invalid. The plugin is not authenticated."
                    };
                    respond::<AuthenticationRequest>(
                        &id,
                        AuthenticationResponse {
                            authenticated,
                            reason: reason.to_string(),
                        },
                    )
                }
            },
            _ if !self.client_authenticated => error(
                &id,
                error_id::REQUEST_REQUIRES_AUTHENTICATION,
                "Request requires authentication.",
            ),
            StatisticsRequest::MESSAGE_TYPE => respond::<StatisticsRequest>(
                &id,
                StatisticsResponse {
                    vtube_studio_version: state.version.clone(),
                    uptime: 0,
                    framerate: 60,
                    allowed_plugins: 1,
                    connected_plugins: 1,
                },
            ),
            CurrentModelRequest::MESSAGE_TYPE => {
                let current = state.current_model.as_deref().and_then(|m| state.model(m));
                respond::<CurrentModelRequest>(
                    &id,
                    CurrentModelResponse {
                        model_loaded: current.is_some(),
                        model_name: current.map(|m| m.name.clone()).unwrap_or_default(),
                        model_id: current.map(|m| m.id.clone()).unwrap_or_default(),
                    },
                )
            }
            AvailableModelsRequest::MESSAGE_TYPE => {
                let available_models: Vec<AvailableModel> = state
                    .models
                    .iter()
                    .map(|m| AvailableModel {
                        model_loaded: state.current_model.as_deref() == Some(m.id.as_str()),
                        model_name: m.name.clone(),
                        model_id: m.id.clone(),
                        vts_model_name: format!("{}.vtube.json", m.name),
                        vts_model_icon_name: String::new(),
                    })
                    .collect();
                respond::<AvailableModelsRequest>(
                    &id,
                    AvailableModelsResponse {
                        number_of_models: available_models.len() as i32,
                        available_models,
                    },
                )
            }
            HotkeysInCurrentModelRequest::MESSAGE_TYPE => {
                match decode::<HotkeysInCurrentModelRequest>(&request) {
                    Err(e) => e,
                    Ok(req) => {
                        let target = req.model_id.or_else(|| state.current_model.clone());
                        let model = target.as_deref().and_then(|m| state.model(m));
                        respond::<HotkeysInCurrentModelRequest>(
                            &id,
                            HotkeysInCurrentModelResponse {
                                model_loaded: model.is_some(),
                                model_name: model.map(|m| m.name.clone()).unwrap_or_default(),
                                model_id: model.map(|m| m.id.clone()).unwrap_or_default(),
                                available_hotkeys: model
                                    .map(|m| m.hotkeys.clone())
                                    .unwrap_or_default(),
                            },
                        )
                    }
                }
            }
            ModelLoadRequest::MESSAGE_TYPE => match decode::<ModelLoadRequest>(&request) {
                Err(e) => e,
                Ok(req) if state.model(&req.model_id).is_none() => {
                    error(&id, error_id::MODEL_ID_NOT_FOUND, "No model with this ID found.")
                }
                Ok(req) => {
                    state.current_model = Some(req.model_id.clone());
                    respond::<ModelLoadRequest>(&id, ModelLoadResponse { model_id: req.model_id })
                }
            },
            HotkeyTriggerRequest::MESSAGE_TYPE => match decode::<HotkeyTriggerRequest>(&request) {
                Err(e) => e,
                Ok(req) => {
                    let known = state
                        .current_model
                        .as_deref()
                        .and_then(|m| state.model(m))
                        .is_some_and(|m| m.hotkeys.iter().any(|h| h.hotkey_id == req.hotkey_id));
                    if known {
                        state.triggered_hotkeys.push(req.hotkey_id.clone());
                        respond::<HotkeyTriggerRequest>(
                            &id,
                            HotkeyTriggerResponse {
                                hotkey_id: req.hotkey_id,
                            },
                        )
                    } else {
                        error(
                            &id,
                            error_id::HOTKEY_ID_NOT_FOUND,
                            "Hotkey not found in current model.",
                        )
                    }
                }
            },
            other => error(
                &id,
                error_id::REQUEST_TYPE_UNKNOWN,
                &format!("unknown message type: {other}"),
            ),
        };

        (response, delay)
    }

    fn send(&mut self, envelope: ApiEnvelope) {
        // Best-effort: a full outbound queue means the client is gone or stuck.
        let _ = self.outbound_tx.try_send(OutboundMsg::Send { envelope });
    }
}

fn decode<R: ApiRequest + DeserializeOwned>(request: &ApiEnvelope) -> Result<R, ApiEnvelope> {
    let data = if request.data.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        request.data.clone()
    };
    serde_json::from_value(data).map_err(|e| {
        error(
            &request.request_id,
            error_id::INTERNAL_SERVER_ERROR,
            &format!("invalid {} payload: {e}", R::MESSAGE_TYPE),
        )
    })
}

fn respond<R: ApiRequest>(request_id: &str, data: impl Serialize) -> ApiEnvelope {
    ApiEnvelope::response(
        request_id,
        vts_protocol::response_type_for(R::MESSAGE_TYPE),
        serde_json::to_value(data).unwrap_or_default(),
        now_millis(),
    )
}

fn error(request_id: &str, id: i32, message: &str) -> ApiEnvelope {
    ApiEnvelope::error(request_id, id, message, now_millis())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
