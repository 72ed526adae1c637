//! The connection actor. It owns the connection state, the session and the catalog;
//! everything that touches the network runs in spawned tasks that report back here.

use crate::catalog::{self, Catalog, CatalogKind, CatalogUpdate};
use crate::config::{BridgeSettings, Endpoint, ReconnectPolicy};
use crate::error::{AuthError, CommandError, ConnectError, RefreshError, RequestError};
use crate::events::EventListener;
use crate::schema::{SchemaRefresher, CHANGE_MODEL, PLACEHOLDER_ID, TOGGLE_HOTKEY};
use crate::state::{ConnectionState, StateTransition};
use crate::token_store::{Credential, TokenStore};
use crate::transport::{call, Session, SessionEvent, Transport};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use url::Url;
use vts_protocol::{HotkeyTriggerRequest, ModelLoadRequest, StatisticsRequest};

pub(crate) type ConnectReply = oneshot::Sender<Result<(), ConnectError>>;
type RefreshReply = oneshot::Sender<Result<(), RefreshError>>;
type CommandReply = oneshot::Sender<Result<(), CommandError>>;

/// A request to act on the device, as chosen on the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    ChangeModel { model_id: String },
    TriggerHotkey { hotkey_id: String },
}

impl Invocation {
    /// Maps a registry command id plus the selected choice id.
    pub fn from_command(command_id: &str, choice_id: &str) -> Option<Self> {
        match command_id {
            CHANGE_MODEL => Some(Invocation::ChangeModel {
                model_id: choice_id.to_string(),
            }),
            TOGGLE_HOTKEY => Some(Invocation::TriggerHotkey {
                hotkey_id: choice_id.to_string(),
            }),
            _ => None,
        }
    }

    fn target(&self) -> &str {
        match self {
            Invocation::ChangeModel { model_id } => model_id,
            Invocation::TriggerHotkey { hotkey_id } => hotkey_id,
        }
    }
}

pub(crate) enum Command {
    Connect { endpoint: Endpoint, reply: ConnectReply },
    Disconnect { reply: oneshot::Sender<()> },
    Refresh { kind: CatalogKind, reply: RefreshReply },
    Execute { invocation: Invocation, reply: CommandReply },
    Shutdown,
}

/// Reports from spawned tasks. Every variant carries the generation it was started under.
pub(crate) enum Internal {
    Phase {
        generation: u64,
        state: ConnectionState,
    },
    Established {
        generation: u64,
        session: Arc<dyn Session>,
        events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
        credential: Credential,
        issued: bool,
        version: Option<String>,
    },
    ConnectFailed {
        generation: u64,
        error: ConnectError,
    },
    Fetched {
        generation: u64,
        kind: CatalogKind,
        result: Result<CatalogUpdate, RequestError>,
        reply: Option<RefreshReply>,
    },
    Executed {
        generation: u64,
        invocation: Invocation,
        result: Result<(), RequestError>,
        reply: CommandReply,
    },
    Disconnected {
        generation: u64,
        reason: String,
    },
    TransportError {
        generation: u64,
        id: i32,
        message: String,
    },
    RetryDue {
        generation: u64,
    },
}

pub(crate) struct Channels {
    pub state: watch::Sender<ConnectionState>,
    pub transitions: broadcast::Sender<StateTransition>,
    pub catalog: watch::Sender<Catalog>,
}

pub(crate) struct Supervisor {
    transport: Arc<dyn Transport>,
    tokens: TokenStore,
    schema: SchemaRefresher,
    settings: BridgeSettings,
    channels: Channels,

    state: ConnectionState,
    catalog: Catalog,
    generation: u64,
    session: Option<Arc<dyn Session>>,
    endpoint: Option<Endpoint>,
    pending_connect: Option<ConnectReply>,
    connect_task: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    tasks: JoinSet<()>,
    backoff: Backoff,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    backlog: VecDeque<Command>,
}

impl Supervisor {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        tokens: TokenStore,
        schema: SchemaRefresher,
        settings: BridgeSettings,
        channels: Channels,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            tokens,
            schema,
            settings,
            channels,
            state: ConnectionState::Disconnected,
            catalog: Catalog::default(),
            generation: 0,
            session: None,
            endpoint: None,
            pending_connect: None,
            connect_task: None,
            listener: None,
            retry: None,
            tasks: JoinSet::new(),
            backoff: Backoff::default(),
            internal_tx,
            internal_rx,
            backlog: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        // Registries render the empty schema before any connection exists.
        self.schema.publish(&self.catalog, self.state);

        loop {
            if let Some(cmd) = self.backlog.pop_front() {
                if !self.handle_command(cmd, &mut rx) {
                    break;
                }
                continue;
            }

            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd, &mut rx) {
                        break;
                    }
                }
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }

        self.teardown();
        debug!("supervisor stopped");
    }

    /// Returns false once the actor should stop.
    fn handle_command(&mut self, cmd: Command, rx: &mut mpsc::Receiver<Command>) -> bool {
        match cmd {
            Command::Connect { endpoint, reply } => {
                let (endpoint, reply) = self.coalesce_connects(endpoint, reply, rx);
                self.connect(endpoint, Some(reply));
            }
            Command::Disconnect { reply } => {
                info!(generation = self.generation, "disconnect requested");
                self.endpoint = None;
                self.teardown();
                let _ = reply.send(());
            }
            Command::Refresh { kind, reply } => {
                if self.state != ConnectionState::Connected {
                    let _ = reply.send(Err(RequestError::NotConnected));
                } else {
                    self.spawn_fetch(kind, Some(reply));
                }
            }
            Command::Execute { invocation, reply } => self.execute(invocation, reply),
            Command::Shutdown => return false,
        }
        true
    }

    /// Drains connects queued behind `first`; only the newest endpoint is dialled.
    fn coalesce_connects(
        &mut self,
        first: Endpoint,
        first_reply: ConnectReply,
        rx: &mut mpsc::Receiver<Command>,
    ) -> (Endpoint, ConnectReply) {
        let mut endpoint = first;
        let mut reply = first_reply;
        while let Ok(next) = rx.try_recv() {
            match next {
                Command::Connect {
                    endpoint: newer,
                    reply: newer_reply,
                } => {
                    let _ = reply.send(Err(ConnectError::Superseded));
                    endpoint = newer;
                    reply = newer_reply;
                }
                other => {
                    self.backlog.push_back(other);
                    break;
                }
            }
        }
        (endpoint, reply)
    }

    fn connect(&mut self, endpoint: Endpoint, reply: Option<ConnectReply>) {
        let url = match endpoint.url() {
            Ok(url) => url,
            Err(e) => {
                warn!(host = %endpoint.host, port = %endpoint.port, error = %e, "refusing to connect");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                return;
            }
        };

        self.teardown();
        self.generation += 1;
        self.endpoint = Some(endpoint);
        self.pending_connect = reply;
        self.transition(ConnectionState::Connecting);

        info!(generation = self.generation, %url, "connecting");
        self.connect_task = Some(tokio::spawn(establish(
            self.generation,
            url,
            Arc::clone(&self.transport),
            self.tokens.get(),
            self.internal_tx.clone(),
        )));
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Phase { generation, state } => {
                if generation == self.generation {
                    self.transition(state);
                }
            }
            Internal::Established {
                generation,
                session,
                events,
                credential,
                issued,
                version,
            } => {
                // A freshly issued token is valid even if this attempt was superseded.
                if issued {
                    if let Err(e) = self.tokens.set(credential) {
                        error!(error = %e, "failed to persist authentication token");
                    }
                }
                if generation != self.generation {
                    debug!(generation, current = self.generation, "dropping superseded session");
                    tokio::spawn(async move { session.disconnect().await });
                    return;
                }
                self.on_established(session, events, version);
            }
            Internal::ConnectFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                warn!(generation, error = %error, "connection attempt failed");
                self.connect_task = None;
                // Rejected or denied credentials need a person; only lost sockets retry.
                let retry = matches!(
                    error,
                    ConnectError::Transport(_) | ConnectError::Auth(AuthError::Transport(_))
                );
                self.transition(ConnectionState::Disconnected);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(error));
                }
                if retry {
                    self.schedule_retry();
                }
            }
            Internal::Fetched {
                generation,
                kind,
                result,
                reply,
            } => self.on_fetched(generation, kind, result, reply),
            Internal::Executed {
                generation,
                invocation,
                result,
                reply,
            } => {
                if generation != self.generation {
                    let _ = reply.send(Err(RequestError::Cancelled.into()));
                    return;
                }
                match &result {
                    Ok(()) => {
                        info!(?invocation, "command executed");
                        if matches!(invocation, Invocation::ChangeModel { .. }) {
                            self.spawn_fetch(CatalogKind::CurrentModel, None);
                            self.spawn_fetch(CatalogKind::Hotkeys, None);
                        }
                    }
                    Err(e) => warn!(?invocation, error = %e, "command failed"),
                }
                let _ = reply.send(result.map_err(CommandError::from));
            }
            Internal::Disconnected { generation, reason } => {
                if generation != self.generation || self.state != ConnectionState::Connected {
                    debug!(generation, %reason, "ignoring disconnect from an old session");
                    return;
                }
                warn!(generation, %reason, "device connection lost");
                self.teardown();
                self.schedule_retry();
            }
            Internal::TransportError {
                generation,
                id,
                message,
            } => {
                if generation == self.generation {
                    error!(generation, error_id = id, %message, "device reported an error");
                }
            }
            Internal::RetryDue { generation } => {
                self.retry = None;
                if generation != self.generation || self.state != ConnectionState::Disconnected {
                    return;
                }
                if let Some(endpoint) = self.endpoint.clone() {
                    info!(generation, "retrying connection");
                    self.connect(endpoint, None);
                }
            }
        }
    }

    fn on_established(
        &mut self,
        session: Arc<dyn Session>,
        events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
        version: Option<String>,
    ) {
        self.connect_task = None;
        match version {
            Some(version) => info!(generation = self.generation, %version, "authenticated with VTube Studio"),
            None => info!(generation = self.generation, "authenticated"),
        }

        self.session = Some(session);
        if let Some(events) = events {
            self.listener = Some(EventListener::spawn(
                self.generation,
                events,
                self.internal_tx.clone(),
            ));
        }
        self.backoff.reset();
        self.transition(ConnectionState::Connected);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(()));
        }

        for kind in CatalogKind::ALL {
            self.spawn_fetch(kind, None);
        }
    }

    fn on_fetched(
        &mut self,
        generation: u64,
        kind: CatalogKind,
        result: Result<CatalogUpdate, RequestError>,
        reply: Option<RefreshReply>,
    ) {
        if generation != self.generation {
            debug!(generation, %kind, "discarding refresh from a torn-down connection");
            if let Some(reply) = reply {
                let _ = reply.send(Err(RequestError::Cancelled));
            }
            return;
        }
        let outcome = match result {
            Ok(update) => {
                self.catalog.apply(update);
                self.schema.publish(&self.catalog, self.state);
                self.channels.catalog.send_replace(self.catalog.clone());
                debug!(generation, %kind, "catalog refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(generation, %kind, error = %e, "refresh failed; keeping cached catalog");
                Err(e)
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn execute(&mut self, invocation: Invocation, reply: CommandReply) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(CommandError::NotConnected(self.state)));
            return;
        }
        let target = invocation.target();
        if target.trim().is_empty() || target == PLACEHOLDER_ID {
            let _ = reply.send(Err(CommandError::NoSelection));
            return;
        }
        let Some(session) = self.session.clone() else {
            let _ = reply.send(Err(CommandError::NotConnected(self.state)));
            return;
        };

        let generation = self.generation;
        let internal = self.internal_tx.clone();
        self.tasks.spawn(async move {
            let result = match &invocation {
                Invocation::ChangeModel { model_id } => call(
                    &*session,
                    &ModelLoadRequest {
                        model_id: model_id.clone(),
                    },
                )
                .await
                .map(|_| ()),
                Invocation::TriggerHotkey { hotkey_id } => call(
                    &*session,
                    &HotkeyTriggerRequest {
                        hotkey_id: hotkey_id.clone(),
                    },
                )
                .await
                .map(|_| ()),
            };
            let _ = internal.send(Internal::Executed {
                generation,
                invocation,
                result,
                reply,
            });
        });
    }

    fn spawn_fetch(&mut self, kind: CatalogKind, reply: Option<RefreshReply>) {
        let Some(session) = self.session.clone() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(RequestError::NotConnected));
            }
            return;
        };
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        self.tasks.spawn(async move {
            let result = catalog::fetch(&*session, kind).await;
            let _ = internal.send(Internal::Fetched {
                generation,
                kind,
                result,
                reply,
            });
        });
    }

    /// Drops the current session and everything started for it, leaving the actor
    /// `Disconnected` with a stale catalog.
    fn teardown(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        self.tasks.abort_all();
        self.generation += 1;

        if let Some(session) = self.session.take() {
            tokio::spawn(async move { session.disconnect().await });
        }
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(ConnectError::Superseded));
        }
        if self.state != ConnectionState::Disconnected {
            self.catalog.invalidate();
            self.transition(ConnectionState::Disconnected);
            self.channels.catalog.send_replace(self.catalog.clone());
        }
    }

    fn schedule_retry(&mut self) {
        if self.settings.reconnect != ReconnectPolicy::Backoff || self.endpoint.is_none() {
            return;
        }
        let delay = self.backoff.next_delay();
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        info!(generation, retry_in_secs = delay.as_secs(), "scheduling reconnect");
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::RetryDue { generation });
        }));
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!(%from, %to, "refusing illegal state transition");
            return;
        }
        self.state = to;
        info!(generation = self.generation, %from, %to, "connection state changed");
        self.schema.publish(&self.catalog, to);
        self.channels.state.send_replace(to);
        let _ = self.channels.transitions.send(StateTransition { from, to });
    }
}

/// Opens the transport and authenticates. Runs off the actor; reports through `internal`.
async fn establish(
    generation: u64,
    url: Url,
    transport: Arc<dyn Transport>,
    stored: Option<Credential>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let session = match transport.connect(&url).await {
        Ok(session) => session,
        Err(e) => {
            let _ = internal.send(Internal::ConnectFailed {
                generation,
                error: e.into(),
            });
            return;
        }
    };
    let events = session.events();
    let _ = internal.send(Internal::Phase {
        generation,
        state: ConnectionState::Authenticating,
    });

    let had_stored = stored.is_some();
    let auth = match session.authenticate(stored.as_ref()).await {
        Ok(credential) => Ok((credential, !had_stored)),
        Err(AuthError::Rejected(reason)) if had_stored => {
            // One interactive exchange per connect; a second refusal is final.
            warn!(generation, %reason, "stored token rejected; requesting a new one");
            session
                .authenticate(None)
                .await
                .map(|credential| (credential, true))
        }
        Err(e) => Err(e),
    };

    let (credential, issued) = match auth {
        Ok(ok) => ok,
        Err(e) => {
            session.disconnect().await;
            let _ = internal.send(Internal::ConnectFailed {
                generation,
                error: e.into(),
            });
            return;
        }
    };

    let version = match call(&*session, &StatisticsRequest {}).await {
        Ok(stats) => Some(stats.vtube_studio_version),
        Err(e) => {
            debug!(generation, error = %e, "statistics unavailable");
            None
        }
    };

    let _ = internal.send(Internal::Established {
        generation,
        session,
        events,
        credential,
        issued,
        version,
    });
}

#[derive(Default)]
struct Backoff {
    idx: usize,
}

impl Backoff {
    fn reset(&mut self) {
        self.idx = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let delays = [1, 2, 5, 10];
        let secs = delays.get(self.idx).copied().unwrap_or(10);
        self.idx = (self.idx + 1).min(delays.len());
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_ten_seconds() {
        let mut backoff = Backoff::default();
        let secs: Vec<_> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 5, 10, 10, 10]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn invocations_map_from_command_ids() {
        assert_eq!(
            Invocation::from_command("change_model", "m-1"),
            Some(Invocation::ChangeModel {
                model_id: "m-1".to_string()
            })
        );
        assert_eq!(
            Invocation::from_command("toggle_hotkey", "hk"),
            Some(Invocation::TriggerHotkey {
                hotkey_id: "hk".to_string()
            })
        );
        assert_eq!(Invocation::from_command("unknown", "x"), None);
    }
}
