use crate::config::ConfigStore;
use crate::error::ConfigError;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Authentication token issued by the device. Never printed.
#[derive(Clone)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} chars>)", self.0.len())
    }
}

/// Pass-through to the configuration store's persisted token field.
#[derive(Clone)]
pub struct TokenStore {
    config: Arc<dyn ConfigStore>,
}

impl TokenStore {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    pub fn get(&self) -> Option<Credential> {
        self.config.read_credential()
    }

    pub fn set(&self, credential: Credential) -> Result<(), ConfigError> {
        self.config.write_credential(&credential)?;
        debug!("persisted new authentication token");
        Ok(())
    }
}
