use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_NAME: &str = "VTubeStudioPublicAPI";
pub const API_VERSION: &str = "1.0";
pub const API_ERROR: &str = "APIError";

/// Error ids carried in `APIError` payloads. Only the ones the bridge reacts to are listed.
pub mod error_id {
    pub const INTERNAL_SERVER_ERROR: i32 = 0;
    pub const REQUEST_TYPE_UNKNOWN: i32 = 5;
    pub const REQUEST_REQUIRES_AUTHENTICATION: i32 = 8;
    pub const TOKEN_REQUEST_DENIED: i32 = 50;
    pub const TOKEN_REQUEST_CURRENTLY_ONGOING: i32 = 51;
    pub const MODEL_ID_NOT_FOUND: i32 = 153;
    pub const HOTKEY_ID_NOT_FOUND: i32 = 202;
}

/// Every frame on the socket, in both directions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiEnvelope {
    #[serde(rename = "apiName")]
    pub api_name: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
}

impl ApiEnvelope {
    pub fn request(request_id: impl Into<String>, message_type: impl Into<String>, data: Value) -> Self {
        Self {
            api_name: API_NAME.to_string(),
            api_version: API_VERSION.to_string(),
            timestamp: None,
            request_id: request_id.into(),
            message_type: message_type.into(),
            data,
        }
    }

    pub fn response(
        request_id: impl Into<String>,
        message_type: impl Into<String>,
        data: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::request(request_id, message_type, data)
        }
    }

    pub fn error(request_id: impl Into<String>, error_id: i32, message: impl Into<String>, timestamp: i64) -> Self {
        let data = ApiErrorData {
            error_id,
            message: message.into(),
        };
        Self::response(
            request_id,
            API_ERROR,
            serde_json::to_value(data).unwrap_or(Value::Null),
            timestamp,
        )
    }

    pub fn is_error(&self) -> bool {
        self.message_type == API_ERROR
    }

    pub fn error_data(&self) -> Option<ApiErrorData> {
        if !self.is_error() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Maps `FooRequest` to `FooResponse`. Anything else is returned unchanged.
pub fn response_type_for(request_type: &str) -> String {
    match request_type.strip_suffix("Request") {
        Some(stem) => format!("{stem}Response"),
        None => request_type.to_string(),
    }
}

/// A request payload with a fixed message type and a typed response payload.
pub trait ApiRequest: Serialize {
    const MESSAGE_TYPE: &'static str;
    type Response: DeserializeOwned;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiErrorData {
    #[serde(rename = "errorID")]
    pub error_id: i32,
    pub message: String,
}

// --- authentication ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationTokenRequest {
    pub plugin_name: String,
    pub plugin_developer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_icon: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationTokenResponse {
    pub authentication_token: String,
}

impl ApiRequest for AuthenticationTokenRequest {
    const MESSAGE_TYPE: &'static str = "AuthenticationTokenRequest";
    type Response = AuthenticationTokenResponse;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub plugin_name: String,
    pub plugin_developer: String,
    pub authentication_token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthenticationResponse {
    pub authenticated: bool,
    #[serde(default)]
    pub reason: String,
}

impl ApiRequest for AuthenticationRequest {
    const MESSAGE_TYPE: &'static str = "AuthenticationRequest";
    type Response = AuthenticationResponse;
}

// --- statistics ---

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StatisticsRequest {}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsResponse {
    #[serde(rename = "vTubeStudioVersion")]
    pub vtube_studio_version: String,
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub framerate: i32,
    #[serde(default)]
    pub allowed_plugins: i32,
    #[serde(default)]
    pub connected_plugins: i32,
}

impl ApiRequest for StatisticsRequest {
    const MESSAGE_TYPE: &'static str = "StatisticsRequest";
    type Response = StatisticsResponse;
}

// --- models ---

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CurrentModelRequest {}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CurrentModelResponse {
    pub model_loaded: bool,
    #[serde(default)]
    pub model_name: String,
    #[serde(rename = "modelID", default)]
    pub model_id: String,
}

impl ApiRequest for CurrentModelRequest {
    const MESSAGE_TYPE: &'static str = "CurrentModelRequest";
    type Response = CurrentModelResponse;
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AvailableModelsRequest {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModel {
    pub model_loaded: bool,
    pub model_name: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(default)]
    pub vts_model_name: String,
    #[serde(default)]
    pub vts_model_icon_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModelsResponse {
    #[serde(default)]
    pub number_of_models: i32,
    pub available_models: Vec<AvailableModel>,
}

impl ApiRequest for AvailableModelsRequest {
    const MESSAGE_TYPE: &'static str = "AvailableModelsRequest";
    type Response = AvailableModelsResponse;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelLoadRequest {
    #[serde(rename = "modelID")]
    pub model_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelLoadResponse {
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ApiRequest for ModelLoadRequest {
    const MESSAGE_TYPE: &'static str = "ModelLoadRequest";
    type Response = ModelLoadResponse;
}

// --- hotkeys ---

/// Omitting `model_id` asks for the hotkeys of whatever model is loaded right now.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HotkeysInCurrentModelRequest {
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hotkey {
    pub name: String,
    #[serde(rename = "type")]
    pub hotkey_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file: String,
    #[serde(rename = "hotkeyID")]
    pub hotkey_id: String,
    #[serde(default)]
    pub key_combination: Vec<String>,
    #[serde(rename = "onScreenButtonID", default = "no_button")]
    pub on_screen_button_id: i32,
}

fn no_button() -> i32 {
    -1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HotkeysInCurrentModelResponse {
    pub model_loaded: bool,
    #[serde(default)]
    pub model_name: String,
    #[serde(rename = "modelID", default)]
    pub model_id: String,
    pub available_hotkeys: Vec<Hotkey>,
}

impl ApiRequest for HotkeysInCurrentModelRequest {
    const MESSAGE_TYPE: &'static str = "HotkeysInCurrentModelRequest";
    type Response = HotkeysInCurrentModelResponse;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HotkeyTriggerRequest {
    #[serde(rename = "hotkeyID")]
    pub hotkey_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HotkeyTriggerResponse {
    #[serde(rename = "hotkeyID")]
    pub hotkey_id: String,
}

impl ApiRequest for HotkeyTriggerRequest {
    const MESSAGE_TYPE: &'static str = "HotkeyTriggerRequest";
    type Response = HotkeyTriggerResponse;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_device_field_names() {
        let env = ApiEnvelope::request("r-1", CurrentModelRequest::MESSAGE_TYPE, json!({}));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["apiName"], API_NAME);
        assert_eq!(v["requestID"], "r-1");
        assert_eq!(v["messageType"], "CurrentModelRequest");
        assert!(v.get("timestamp").is_none());
    }

    #[test]
    fn error_envelope_exposes_payload() {
        let env = ApiEnvelope::error("r-2", error_id::TOKEN_REQUEST_DENIED, "denied", 7);
        let data = env.error_data().expect("error payload");
        assert_eq!(data.error_id, error_id::TOKEN_REQUEST_DENIED);
        assert_eq!(data.message, "denied");
    }

    #[test]
    fn hotkey_without_button_defaults_to_minus_one() {
        let hotkey: Hotkey = serde_json::from_value(json!({
            "name": "Wave",
            "type": "TriggerAnimation",
            "hotkeyID": "hk-1"
        }))
        .unwrap();
        assert_eq!(hotkey.on_screen_button_id, -1);
        assert!(hotkey.key_combination.is_empty());
    }

    #[test]
    fn response_type_swaps_suffix() {
        assert_eq!(response_type_for("ModelLoadRequest"), "ModelLoadResponse");
        assert_eq!(response_type_for(API_ERROR), API_ERROR);
    }
}
