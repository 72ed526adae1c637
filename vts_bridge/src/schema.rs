//! Turns the catalog into the command and status schema the control surface renders.

use crate::catalog::Catalog;
use crate::collate::locale_cmp;
use crate::registry::{CommandRegistry, StatusDisplayRegistry};
use crate::state::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Id of the leading "nothing selected" choice.
pub const PLACEHOLDER_ID: &str = "0";

pub const CHANGE_MODEL: &str = "change_model";
pub const TOGGLE_HOTKEY: &str = "toggle_hotkey";

pub const STATUS_CURRENT_MODEL: &str = "current_model";
pub const STATUS_CONNECTION_STATE: &str = "connection_state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
}

impl Choice {
    fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDefinition {
    pub id: String,
    pub name: String,
    pub option_id: String,
    pub option_label: String,
    pub default: String,
    pub choices: Vec<Choice>,
}

fn sort_choices(mut choices: Vec<Choice>) -> Vec<Choice> {
    // `sort_by` is stable; equal labels keep id order.
    choices.sort_by(|a, b| locale_cmp(&a.label, &b.label));
    choices
}

pub fn choices_from_models(catalog: &Catalog) -> Vec<Choice> {
    sort_choices(
        catalog
            .models()
            .map(|m| Choice::new(m.model_id.clone(), m.model_name.clone()))
            .collect(),
    )
}

pub fn choices_from_hotkeys(catalog: &Catalog) -> Vec<Choice> {
    sort_choices(
        catalog
            .hotkeys()
            .map(|h| Choice::new(h.hotkey_id.clone(), h.name.clone()))
            .collect(),
    )
}

fn with_placeholder(label: &str, choices: Vec<Choice>) -> Vec<Choice> {
    std::iter::once(Choice::new(PLACEHOLDER_ID, label))
        .chain(choices)
        .collect()
}

pub fn command_definitions(catalog: &Catalog) -> Vec<CommandDefinition> {
    vec![
        CommandDefinition {
            id: CHANGE_MODEL.to_string(),
            name: "Change Model".to_string(),
            option_id: "model".to_string(),
            option_label: "Model".to_string(),
            default: PLACEHOLDER_ID.to_string(),
            choices: with_placeholder("Select Model", choices_from_models(catalog)),
        },
        CommandDefinition {
            id: TOGGLE_HOTKEY.to_string(),
            name: "Toggle Hotkey".to_string(),
            option_id: "hotkey".to_string(),
            option_label: "Hotkey".to_string(),
            default: PLACEHOLDER_ID.to_string(),
            choices: with_placeholder("Select Hotkey", choices_from_hotkeys(catalog)),
        },
    ]
}

pub fn status_values(catalog: &Catalog, state: ConnectionState) -> BTreeMap<String, String> {
    let current = catalog
        .current_model()
        .map(|m| m.model_name.clone())
        .unwrap_or_default();
    BTreeMap::from([
        (STATUS_CURRENT_MODEL.to_string(), current),
        (STATUS_CONNECTION_STATE.to_string(), state.as_str().to_string()),
    ])
}

/// Pushes the derived schema into both registries.
#[derive(Clone)]
pub struct SchemaRefresher {
    commands: Arc<dyn CommandRegistry>,
    status: Arc<dyn StatusDisplayRegistry>,
}

impl SchemaRefresher {
    pub fn new(commands: Arc<dyn CommandRegistry>, status: Arc<dyn StatusDisplayRegistry>) -> Self {
        Self { commands, status }
    }

    pub fn publish(&self, catalog: &Catalog, state: ConnectionState) {
        let commands = command_definitions(catalog);
        debug!(
            models = commands[0].choices.len() - 1,
            hotkeys = commands[1].choices.len() - 1,
            %state,
            "publishing schema"
        );
        self.commands.set_commands(commands);
        self.status.set_values(status_values(catalog, state));
    }
}
