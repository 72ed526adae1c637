use crate::error::{AuthError, RequestError, TransportError};
use crate::token_store::Credential;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;
use vts_protocol::ApiRequest;

/// Pushed by a session without being asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Disconnected { reason: String },
    Error { id: i32, message: String },
}

/// Opens sessions to the device. Request timeouts are the transport's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn Session>, TransportError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    /// With a credential: present it. Without: run the interactive token exchange and
    /// authenticate with the token the device hands out. Returns the credential in use.
    async fn authenticate(&self, credential: Option<&Credential>) -> Result<Credential, AuthError>;

    async fn request(&self, message_type: &str, data: Value) -> Result<Value, RequestError>;

    /// Takes the session's event stream. Events raised before the call are buffered;
    /// later calls return `None`.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;

    async fn disconnect(&self);
}

pub async fn call<R>(session: &dyn Session, request: &R) -> Result<R::Response, RequestError>
where
    R: ApiRequest + Sync,
{
    exchange_typed(request, |message_type, data| session.request(message_type, data)).await
}

/// Encodes `request`, hands it to `send` and decodes the reply as `R::Response`.
pub(crate) async fn exchange_typed<R, F, Fut>(request: &R, send: F) -> Result<R::Response, RequestError>
where
    R: ApiRequest + Sync,
    F: FnOnce(&'static str, Value) -> Fut,
    Fut: Future<Output = Result<Value, RequestError>>,
{
    let data = serde_json::to_value(request).map_err(TransportError::Codec)?;
    let response = send(R::MESSAGE_TYPE, data).await?;
    serde_json::from_value(response).map_err(RequestError::Decode)
}
