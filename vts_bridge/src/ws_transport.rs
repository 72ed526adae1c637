use crate::config::BridgeSettings;
use crate::error::{AuthError, RequestError, TransportError};
use crate::token_store::Credential;
use crate::transport::{exchange_typed, Session, SessionEvent, Transport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;
use vts_protocol::{ApiEnvelope, AuthenticationRequest, AuthenticationTokenRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Waiter = oneshot::Sender<Result<ApiEnvelope, TransportError>>;
type Pending = Arc<Mutex<HashMap<String, Waiter>>>;

const OUTBOUND_CAP: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// VTube Studio public API over tokio-tungstenite.
pub struct WsTransport {
    settings: BridgeSettings,
}

impl WsTransport {
    pub fn new(settings: BridgeSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn Session>, TransportError> {
        let limit = self.settings.connect_timeout();
        let (socket, _) = tokio::time::timeout(limit, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(limit))??;
        debug!(%url, "websocket open");
        Ok(Arc::new(WsSession::start(socket, self.settings.clone())))
    }
}

struct WsSession {
    settings: BridgeSettings,
    out_tx: mpsc::Sender<Message>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsSession {
    fn start(socket: WsStream, settings: BridgeSettings) -> Self {
        let (write, read) = socket.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAP);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(write, out_rx));
        let reader = tokio::spawn(read_loop(
            read,
            Arc::clone(&pending),
            Arc::clone(&closed),
            events_tx,
        ));

        Self {
            settings,
            out_tx,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            events_rx: Mutex::new(Some(events_rx)),
            reader: Mutex::new(Some(reader)),
        }
    }

    async fn exchange(
        &self,
        message_type: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let request_id = format!("vts-bridge-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let envelope = ApiEnvelope::request(request_id.clone(), message_type, data);
        let payload = serde_json::to_string(&envelope).map_err(TransportError::Codec)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().map_err(|_| TransportError::Closed)?;
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed.into());
            }
            pending.insert(request_id.clone(), tx);
        }

        if self.out_tx.send(Message::Text(payload.into())).await.is_err() {
            self.forget(&request_id);
            return Err(TransportError::Closed.into());
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TransportError::Closed.into()),
            Err(_) => {
                self.forget(&request_id);
                return Err(TransportError::Timeout(timeout).into());
            }
        };

        if response.is_error() {
            let (id, message) = response
                .error_data()
                .map(|e| (e.error_id, e.message))
                .unwrap_or_else(|| (-1, "malformed APIError payload".to_string()));
            return Err(RequestError::Api { id, message });
        }
        Ok(response.data)
    }

    fn forget(&self, request_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(request_id);
        }
    }
}

#[async_trait]
impl Session for WsSession {
    async fn authenticate(&self, credential: Option<&Credential>) -> Result<Credential, AuthError> {
        let credential = match credential {
            Some(c) => c.clone(),
            None => {
                let request = AuthenticationTokenRequest {
                    plugin_name: self.settings.plugin_name.clone(),
                    plugin_developer: self.settings.plugin_developer.clone(),
                    plugin_icon: self.settings.plugin_icon.clone(),
                };
                debug!("requesting a new authentication token; waiting for approval on the device");
                let limit = self.settings.auth_timeout();
                let issued = exchange_typed(&request, |t, d| self.exchange(t, d, limit))
                    .await
                    .map_err(auth_failure)?;
                Credential::new(issued.authentication_token)
            }
        };

        let request = AuthenticationRequest {
            plugin_name: self.settings.plugin_name.clone(),
            plugin_developer: self.settings.plugin_developer.clone(),
            authentication_token: credential.as_str().to_string(),
        };
        let limit = self.settings.request_timeout();
        let response = exchange_typed(&request, |t, d| self.exchange(t, d, limit))
            .await
            .map_err(auth_failure)?;

        if response.authenticated {
            Ok(credential)
        } else {
            Err(AuthError::Rejected(response.reason))
        }
    }

    async fn request(&self, message_type: &str, data: Value) -> Result<Value, RequestError> {
        self.exchange(message_type, data, self.settings.request_timeout())
            .await
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().ok().and_then(|mut g| g.take())
    }

    async fn disconnect(&self) {
        let _ = self.out_tx.send(Message::Close(None)).await;
        let reader = self.reader.lock().ok().and_then(|mut g| g.take());
        if let Some(mut reader) = reader {
            if tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        if let Ok(mut g) = self.reader.lock() {
            if let Some(reader) = g.take() {
                reader.abort();
            }
        }
    }
}

fn auth_failure(err: RequestError) -> AuthError {
    match err {
        RequestError::Transport(e) => AuthError::Transport(e),
        RequestError::Api { id, message } => AuthError::Denied(format!("{message} (error {id})")),
        other => AuthError::Denied(other.to_string()),
    }
}

async fn write_loop(mut write: SplitSink<WsStream, Message>, mut out_rx: mpsc::Receiver<Message>) {
    while let Some(msg) = out_rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if write.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope: ApiEnvelope = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable device message");
                        continue;
                    }
                };
                let waiter = pending
                    .lock()
                    .ok()
                    .and_then(|mut g| g.remove(&envelope.request_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(envelope));
                    }
                    None => match envelope.error_data() {
                        Some(err) => {
                            let _ = events.send(SessionEvent::Error {
                                id: err.error_id,
                                message: err.message,
                            });
                        }
                        None => {
                            debug!(message_type = %envelope.message_type, "ignoring unsolicited device message");
                        }
                    },
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by device".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    closed.store(true, Ordering::SeqCst);
    if let Ok(mut g) = pending.lock() {
        for (_, waiter) in g.drain() {
            let _ = waiter.send(Err(TransportError::Closed));
        }
    }
    let _ = events.send(SessionEvent::Disconnected { reason });
}
