use crate::state::ConnectionState;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid device url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Rejected(String),
    #[error("token request denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,
    #[error("device error {id}: {message}")]
    Api { id: i32, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected response payload: {0}")]
    Decode(serde_json::Error),
    #[error("connection was torn down before the response was applied")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("host and port must both be configured")]
    MissingEndpoint,
    #[error(transparent)]
    InvalidEndpoint(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("superseded by a newer connect or disconnect")]
    Superseded,
    #[error("bridge is not running")]
    BridgeStopped,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command refused while {0}")]
    NotConnected(ConnectionState),
    #[error("no choice selected")]
    NoSelection,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("bridge is not running")]
    BridgeStopped,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Catalog refreshes fail with the same shapes as any other request.
pub type RefreshError = RequestError;
