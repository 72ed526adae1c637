use crate::error::ConfigError;
use crate::token_store::Credential;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

pub const ENV_BRIDGE_CONFIG: &str = "VTS_BRIDGE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./vts_bridge.json";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8001";
const DEFAULT_PLUGIN_NAME: &str = "VTS Control Bridge";
const DEFAULT_PLUGIN_DEVELOPER: &str = "vts_bridge";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
// Token requests wait on a human clicking "Allow" inside VTube Studio.
const DEFAULT_AUTH_TIMEOUT_MS: u64 = 60_000;

/// Persisted configuration. The credential lives here so it survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<String>,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            authentication_token: None,
            bridge: BridgeSettings::default(),
        }
    }
}

impl BridgeConfig {
    pub fn with_endpoint(host: &str, port: &str) -> Self {
        Self {
            host: host.to_string(),
            port: port.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default = "default_plugin_name")]
    pub plugin_name: String,
    #[serde(default = "default_plugin_developer")]
    pub plugin_developer: String,
    /// Base64 PNG, 128x128, shown in the device's approval popup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_icon: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Covers the TCP connect plus the websocket handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            plugin_name: default_plugin_name(),
            plugin_developer: default_plugin_developer(),
            plugin_icon: None,
            request_timeout_ms: default_request_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BridgeSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// What the supervisor does after losing (or failing to open) a connection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Stay disconnected until someone calls connect again.
    #[default]
    Manual,
    /// Retry on a 1s/2s/5s/10s schedule until connected or explicitly disconnected.
    Backoff,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_plugin_name() -> String {
    DEFAULT_PLUGIN_NAME.to_string()
}

fn default_plugin_developer() -> String {
    DEFAULT_PLUGIN_DEVELOPER.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_auth_timeout_ms() -> u64 {
    DEFAULT_AUTH_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && !self.port.trim().is_empty()
    }

    pub fn url(&self) -> Result<Url, ConfigError> {
        let host = self.host.trim();
        let port: u16 = self
            .port
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(format!("port {:?} is not a number", self.port)))?;
        Url::parse(&format!("ws://{host}:{port}"))
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{host}:{port}: {e}")))
    }
}

/// The narrow view of configuration the bridge consumes.
pub trait ConfigStore: Send + Sync {
    /// `None` while host or port is absent or empty.
    fn read_endpoint(&self) -> Option<Endpoint>;
    fn read_credential(&self) -> Option<Credential>;
    fn write_credential(&self, credential: &Credential) -> Result<(), ConfigError>;
}

fn endpoint_of(config: &BridgeConfig) -> Option<Endpoint> {
    let endpoint = Endpoint::new(config.host.clone(), config.port.clone());
    endpoint.is_complete().then_some(endpoint)
}

fn credential_of(config: &BridgeConfig) -> Option<Credential> {
    config
        .authentication_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(Credential::new)
}

/// Keeps configuration in memory only.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<BridgeConfig>,
    credential_writes: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Mutex::new(config),
            credential_writes: AtomicUsize::new(0),
        }
    }

    pub fn set_endpoint(&self, host: &str, port: &str) {
        if let Ok(mut g) = self.config.lock() {
            g.host = host.to_string();
            g.port = port.to_string();
        }
    }

    pub fn stored_token(&self) -> Option<String> {
        self.config.lock().ok()?.authentication_token.clone()
    }

    pub fn credential_writes(&self) -> usize {
        self.credential_writes.load(Ordering::SeqCst)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read_endpoint(&self) -> Option<Endpoint> {
        endpoint_of(&*self.config.lock().ok()?)
    }

    fn read_credential(&self) -> Option<Credential> {
        credential_of(&*self.config.lock().ok()?)
    }

    fn write_credential(&self, credential: &Credential) -> Result<(), ConfigError> {
        let mut g = self
            .config
            .lock()
            .map_err(|_| ConfigError::Io(std::io::Error::other("config lock poisoned")))?;
        g.authentication_token = Some(credential.as_str().to_string());
        self.credential_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Configuration backed by a JSON file; credential writes are persisted immediately.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    config: Mutex<BridgeConfig>,
}

impl JsonFileConfigStore {
    /// A missing file yields the defaults; it is created on the first credential write.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = read_config_file(&path)?;
        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_BRIDGE_CONFIG)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> BridgeConfig {
        self.config
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn settings(&self) -> BridgeSettings {
        self.config().bridge
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn read_endpoint(&self) -> Option<Endpoint> {
        endpoint_of(&*self.config.lock().ok()?)
    }

    fn read_credential(&self) -> Option<Credential> {
        credential_of(&*self.config.lock().ok()?)
    }

    fn write_credential(&self, credential: &Credential) -> Result<(), ConfigError> {
        let mut g = self
            .config
            .lock()
            .map_err(|_| ConfigError::Io(std::io::Error::other("config lock poisoned")))?;
        g.authentication_token = Some(credential.as_str().to_string());
        write_config_file(&self.path, &g)
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BridgeConfig::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_config_file(path: &Path, config: &BridgeConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let payload = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
