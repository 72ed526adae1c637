//! Keeps one authenticated VTube Studio connection alive and mirrors its models and
//! hotkeys into a command/status schema.
//!
//! [`Bridge::spawn`] starts the supervisor actor and hands back a cloneable handle.

pub mod catalog;
pub mod collate;
pub mod config;
pub mod error;
mod events;
pub mod registry;
pub mod schema;
pub mod state;
mod supervisor;
pub mod token_store;
pub mod transport;
pub mod ws_transport;

pub use catalog::{Catalog, CatalogKind, HotkeyDescriptor, ModelDescriptor};
pub use config::{
    BridgeConfig, BridgeSettings, ConfigStore, Endpoint, JsonFileConfigStore, MemoryConfigStore,
    ReconnectPolicy,
};
pub use error::{AuthError, CommandError, ConfigError, ConnectError, RefreshError, RequestError, TransportError};
pub use registry::{CommandRegistry, InMemoryRegistry, StatusDisplayRegistry};
pub use schema::{Choice, CommandDefinition};
pub use state::{ConnectionState, StateTransition};
pub use supervisor::Invocation;
pub use token_store::{Credential, TokenStore};
pub use transport::{Session, SessionEvent, Transport};
pub use ws_transport::WsTransport;

use schema::SchemaRefresher;
use std::sync::Arc;
use supervisor::{Channels, Command, Supervisor};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_CAP: usize = 256;
const TRANSITION_CAP: usize = 64;

/// Everything the bridge talks to.
pub struct BridgeDeps {
    pub transport: Arc<dyn Transport>,
    pub config: Arc<dyn ConfigStore>,
    pub commands: Arc<dyn CommandRegistry>,
    pub status: Arc<dyn StatusDisplayRegistry>,
    pub settings: BridgeSettings,
}

impl BridgeDeps {
    /// The WebSocket transport plus one registry serving both roles.
    pub fn websocket<R>(config: Arc<dyn ConfigStore>, registry: Arc<R>, settings: BridgeSettings) -> Self
    where
        R: CommandRegistry + StatusDisplayRegistry + 'static,
    {
        Self {
            transport: Arc::new(WsTransport::new(settings.clone())),
            config,
            commands: registry.clone(),
            status: registry,
            settings,
        }
    }
}

#[derive(Clone)]
pub struct Bridge {
    tx: mpsc::Sender<Command>,
    config: Arc<dyn ConfigStore>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    catalog: watch::Receiver<Catalog>,
}

impl Bridge {
    /// Must be called inside a tokio runtime.
    pub fn spawn(deps: BridgeDeps) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAP);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAP);
        let (catalog_tx, catalog_rx) = watch::channel(Catalog::default());

        let supervisor = Supervisor::new(
            deps.transport,
            TokenStore::new(Arc::clone(&deps.config)),
            SchemaRefresher::new(deps.commands, deps.status),
            deps.settings,
            Channels {
                state: state_tx,
                transitions: transitions.clone(),
                catalog: catalog_tx,
            },
        );
        let task = tokio::spawn(supervisor.run(rx));

        let bridge = Self {
            tx,
            config: deps.config,
            state: state_rx,
            transitions,
            catalog: catalog_rx,
        };
        (bridge, task)
    }

    /// Replaces any existing connection. Resolves once `Connected` or once the attempt fails.
    pub async fn connect_to(&self, endpoint: Endpoint) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { endpoint, reply })
            .await
            .map_err(|_| ConnectError::BridgeStopped)?;
        rx.await.map_err(|_| ConnectError::BridgeStopped)?
    }

    /// Reconnects using the endpoint currently held by the configuration store.
    /// Without one the current connection is left alone.
    pub async fn connect_from_config(&self) -> Result<(), ConnectError> {
        let endpoint = self
            .config
            .read_endpoint()
            .ok_or(ConnectError::MissingEndpoint)?;
        self.connect_to(endpoint).await
    }

    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Every transition from now on, in order.
    pub fn on_state_change(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Latest-value view of the state, for waiting on a particular state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn catalog(&self) -> Catalog {
        self.catalog.borrow().clone()
    }

    pub fn watch_catalog(&self) -> watch::Receiver<Catalog> {
        self.catalog.clone()
    }

    pub async fn refresh_current_model(&self) -> Result<(), RefreshError> {
        self.refresh(CatalogKind::CurrentModel).await
    }

    pub async fn refresh_available_models(&self) -> Result<(), RefreshError> {
        self.refresh(CatalogKind::AvailableModels).await
    }

    pub async fn refresh_available_hotkeys_for_current_model(&self) -> Result<(), RefreshError> {
        self.refresh(CatalogKind::Hotkeys).await
    }

    async fn refresh(&self, kind: CatalogKind) -> Result<(), RefreshError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Refresh { kind, reply })
            .await
            .map_err(|_| RequestError::Cancelled)?;
        rx.await.map_err(|_| RequestError::Cancelled)?
    }

    pub async fn execute(&self, invocation: Invocation) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Execute { invocation, reply })
            .await
            .map_err(|_| CommandError::BridgeStopped)?;
        rx.await.unwrap_or(Err(CommandError::BridgeStopped))
    }

    /// Tears down the connection and stops the actor.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}
