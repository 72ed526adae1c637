use crate::schema::CommandDefinition;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Receives the full command set on every publish.
pub trait CommandRegistry: Send + Sync {
    fn set_commands(&self, commands: Vec<CommandDefinition>);
}

/// Receives the full status map on every publish.
pub trait StatusDisplayRegistry: Send + Sync {
    fn set_values(&self, values: BTreeMap<String, String>);
}

/// Keeps whatever was published last.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    commands: Mutex<Vec<CommandDefinition>>,
    values: Mutex<BTreeMap<String, String>>,
    publishes: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<CommandDefinition> {
        self.commands.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn command(&self, id: &str) -> Option<CommandDefinition> {
        self.commands().into_iter().find(|c| c.id == id)
    }

    pub fn values(&self) -> BTreeMap<String, String> {
        self.values.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values().get(key).cloned()
    }

    /// Number of `set_commands` calls so far.
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

impl CommandRegistry for InMemoryRegistry {
    fn set_commands(&self, commands: Vec<CommandDefinition>) {
        if let Ok(mut g) = self.commands.lock() {
            *g = commands;
        }
        self.publishes.fetch_add(1, Ordering::SeqCst);
    }
}

impl StatusDisplayRegistry for InMemoryRegistry {
    fn set_values(&self, values: BTreeMap<String, String>) {
        if let Ok(mut g) = self.values.lock() {
            *g = values;
        }
    }
}
