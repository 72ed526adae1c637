use serde_json::json;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tungstenite::Message;
use vts_mock_device::{DeviceState, MockDevice};
use vts_protocol::{
    error_id, ApiEnvelope, ApiRequest, AuthenticationRequest, AuthenticationResponse,
    AuthenticationTokenRequest, AuthenticationTokenResponse, AvailableModelsRequest,
    AvailableModelsResponse, CurrentModelRequest, HotkeysInCurrentModelRequest,
    HotkeysInCurrentModelResponse, ModelLoadRequest,
};

type Client = tungstenite::WebSocket<TcpStream>;

fn connect(device: &MockDevice) -> Client {
    let addr = device.listen_addr();
    let stream = TcpStream::connect(addr).expect("tcp connect");
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));
    let (ws, _) = tungstenite::client(format!("ws://{addr}"), stream).expect("ws connect");
    ws
}

fn read_envelope(ws: &mut Client, timeout: Duration) -> ApiEnvelope {
    let deadline = Instant::now() + timeout;
    loop {
        match ws.read() {
            Ok(Message::Text(s)) => return serde_json::from_str(&s).expect("valid device json"),
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if Instant::now() >= deadline {
                    panic!("timeout waiting for device message");
                }
            }
            Err(e) => panic!("ws read failed: {e:?}"),
        }
    }
}

fn call(ws: &mut Client, id: &str, message_type: &str, data: serde_json::Value) -> ApiEnvelope {
    let request = ApiEnvelope::request(id, message_type, data);
    ws.send(Message::Text(serde_json::to_string(&request).unwrap().into()))
        .unwrap();
    let response = read_envelope(ws, Duration::from_secs(2));
    assert_eq!(response.request_id, id);
    response
}

fn authenticate(ws: &mut Client) -> String {
    let token = call(
        ws,
        "t-1",
        AuthenticationTokenRequest::MESSAGE_TYPE,
        json!({ "pluginName": "test", "pluginDeveloper": "tests" }),
    );
    let token: AuthenticationTokenResponse = serde_json::from_value(token.data).unwrap();

    let auth = call(
        ws,
        "t-2",
        AuthenticationRequest::MESSAGE_TYPE,
        json!({
            "pluginName": "test",
            "pluginDeveloper": "tests",
            "authenticationToken": token.authentication_token,
        }),
    );
    let auth: AuthenticationResponse = serde_json::from_value(auth.data).unwrap();
    assert!(auth.authenticated);
    token.authentication_token
}

#[test]
fn catalog_requests_require_authentication() {
    let device = MockDevice::spawn_with_addr("127.0.0.1:0", DeviceState::demo()).expect("spawn");
    let mut ws = connect(&device);

    let denied = call(&mut ws, "r-1", CurrentModelRequest::MESSAGE_TYPE, json!({}));
    let err = denied.error_data().expect("error payload");
    assert_eq!(err.error_id, error_id::REQUEST_REQUIRES_AUTHENTICATION);

    let token = authenticate(&mut ws);
    assert_eq!(device.control().issued_tokens(), vec![token]);

    let models = call(&mut ws, "r-2", AvailableModelsRequest::MESSAGE_TYPE, json!({}));
    assert_eq!(models.message_type, "AvailableModelsResponse");
    let models: AvailableModelsResponse = serde_json::from_value(models.data).unwrap();
    assert_eq!(models.available_models.len(), 3);
    assert_eq!(
        models
            .available_models
            .iter()
            .filter(|m| m.model_loaded)
            .count(),
        1
    );

    device.shutdown();
}

#[test]
fn model_load_switches_hotkey_scope() {
    let device = MockDevice::spawn_with_addr("127.0.0.1:0", DeviceState::demo()).expect("spawn");
    let mut ws = connect(&device);
    authenticate(&mut ws);

    let loaded = call(
        &mut ws,
        "r-1",
        ModelLoadRequest::MESSAGE_TYPE,
        json!({ "modelID": "m-alpha" }),
    );
    assert!(!loaded.is_error(), "unexpected error: {:?}", loaded.data);
    assert_eq!(device.control().current_model().as_deref(), Some("m-alpha"));

    let hotkeys = call(&mut ws, "r-2", HotkeysInCurrentModelRequest::MESSAGE_TYPE, json!({}));
    let hotkeys: HotkeysInCurrentModelResponse = serde_json::from_value(hotkeys.data).unwrap();
    assert_eq!(hotkeys.model_id, "m-alpha");
    assert_eq!(hotkeys.available_hotkeys.len(), 1);
    assert_eq!(hotkeys.available_hotkeys[0].hotkey_id, "hk-angry");

    let missing = call(
        &mut ws,
        "r-3",
        ModelLoadRequest::MESSAGE_TYPE,
        json!({ "modelID": "nope" }),
    );
    assert_eq!(
        missing.error_data().map(|e| e.error_id),
        Some(error_id::MODEL_ID_NOT_FOUND)
    );

    device.shutdown();
}

#[test]
fn denied_token_request_reports_error() {
    let mut state = DeviceState::demo();
    state.deny_token_requests = true;
    let device = MockDevice::spawn_with_addr("127.0.0.1:0", state).expect("spawn");
    let mut ws = connect(&device);

    let denied = call(
        &mut ws,
        "t-1",
        AuthenticationTokenRequest::MESSAGE_TYPE,
        json!({ "pluginName": "test", "pluginDeveloper": "tests" }),
    );
    assert_eq!(
        denied.error_data().map(|e| e.error_id),
        Some(error_id::TOKEN_REQUEST_DENIED)
    );
    assert!(device.control().issued_tokens().is_empty());

    device.shutdown();
}

#[test]
fn kick_closes_the_client() {
    let device = MockDevice::spawn_with_addr("127.0.0.1:0", DeviceState::demo()).expect("spawn");
    let mut ws = connect(&device);
    authenticate(&mut ws);

    device.control().kick_client();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match ws.read() {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
        if Instant::now() >= deadline {
            panic!("client was not closed");
        }
    }

    device.shutdown();
}
