//! Local mirror of the device's models and hotkeys.
//!
//! The supervisor owns the single `Catalog`; fetches run off the actor and come back as
//! `CatalogUpdate`s that are applied in one step.

use crate::error::RequestError;
use crate::transport::{call, Session};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use vts_protocol::{AvailableModelsRequest, CurrentModelRequest, HotkeysInCurrentModelRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub model_name: String,
    pub loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotkeyDescriptor {
    pub hotkey_id: String,
    pub name: String,
    /// The device's action type, e.g. `ToggleExpression`.
    pub kind: String,
    /// The model this hotkey belongs to.
    pub model_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    CurrentModel,
    AvailableModels,
    Hotkeys,
}

impl CatalogKind {
    pub const ALL: [CatalogKind; 3] = [
        CatalogKind::CurrentModel,
        CatalogKind::AvailableModels,
        CatalogKind::Hotkeys,
    ];
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CatalogKind::CurrentModel => "current model",
            CatalogKind::AvailableModels => "available models",
            CatalogKind::Hotkeys => "hotkeys",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogUpdate {
    CurrentModel(Option<ModelDescriptor>),
    AvailableModels(Vec<ModelDescriptor>),
    Hotkeys {
        model_id: Option<String>,
        hotkeys: Vec<HotkeyDescriptor>,
    },
}

impl CatalogUpdate {
    pub fn kind(&self) -> CatalogKind {
        match self {
            CatalogUpdate::CurrentModel(_) => CatalogKind::CurrentModel,
            CatalogUpdate::AvailableModels(_) => CatalogKind::AvailableModels,
            CatalogUpdate::Hotkeys { .. } => CatalogKind::Hotkeys,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Catalog {
    current_model: Option<ModelDescriptor>,
    models: BTreeMap<String, ModelDescriptor>,
    hotkeys: BTreeMap<String, HotkeyDescriptor>,
    hotkeys_model_id: Option<String>,
    stale: BTreeSet<CatalogKind>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            current_model: None,
            models: BTreeMap::new(),
            hotkeys: BTreeMap::new(),
            hotkeys_model_id: None,
            // Nothing has been fetched yet.
            stale: CatalogKind::ALL.into_iter().collect(),
        }
    }
}

impl Catalog {
    pub fn current_model(&self) -> Option<&ModelDescriptor> {
        self.current_model.as_ref()
    }

    /// Enumerated in id order.
    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    /// Enumerated in id order.
    pub fn hotkeys(&self) -> impl Iterator<Item = &HotkeyDescriptor> {
        self.hotkeys.values()
    }

    /// The model the current hotkey set was fetched for.
    pub fn hotkeys_model_id(&self) -> Option<&str> {
        self.hotkeys_model_id.as_deref()
    }

    pub fn is_stale(&self) -> bool {
        !self.stale.is_empty()
    }

    pub fn is_kind_stale(&self, kind: CatalogKind) -> bool {
        self.stale.contains(&kind)
    }

    pub(crate) fn apply(&mut self, update: CatalogUpdate) {
        self.stale.remove(&update.kind());
        match update {
            CatalogUpdate::CurrentModel(model) => self.current_model = model,
            CatalogUpdate::AvailableModels(models) => {
                self.models = models
                    .into_iter()
                    .map(|m| (m.model_id.clone(), m))
                    .collect();
            }
            CatalogUpdate::Hotkeys { model_id, hotkeys } => {
                // Model-scoped: replace, never merge.
                self.hotkeys_model_id = model_id;
                self.hotkeys = hotkeys
                    .into_iter()
                    .map(|h| (h.hotkey_id.clone(), h))
                    .collect();
            }
        }
    }

    /// Keeps the data but marks all of it untrustworthy until refetched.
    pub(crate) fn invalidate(&mut self) {
        self.stale.extend(CatalogKind::ALL);
    }
}

pub(crate) async fn fetch(session: &dyn Session, kind: CatalogKind) -> Result<CatalogUpdate, RequestError> {
    match kind {
        CatalogKind::CurrentModel => {
            let current = call(session, &CurrentModelRequest {}).await?;
            let model = current.model_loaded.then(|| ModelDescriptor {
                model_id: current.model_id,
                model_name: current.model_name,
                loaded: true,
            });
            Ok(CatalogUpdate::CurrentModel(model))
        }
        CatalogKind::AvailableModels => {
            let available = call(session, &AvailableModelsRequest {}).await?;
            Ok(CatalogUpdate::AvailableModels(
                available
                    .available_models
                    .into_iter()
                    .map(|m| ModelDescriptor {
                        model_id: m.model_id,
                        model_name: m.model_name,
                        loaded: m.model_loaded,
                    })
                    .collect(),
            ))
        }
        CatalogKind::Hotkeys => {
            let response = call(session, &HotkeysInCurrentModelRequest::default()).await?;
            let model_id = response.model_id;
            let hotkeys = response
                .available_hotkeys
                .into_iter()
                .map(|h| HotkeyDescriptor {
                    hotkey_id: h.hotkey_id,
                    name: h.name,
                    kind: h.hotkey_type,
                    model_id: model_id.clone(),
                })
                .collect();
            Ok(CatalogUpdate::Hotkeys {
                model_id: response.model_loaded.then_some(model_id),
                hotkeys,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotkey(id: &str, name: &str) -> HotkeyDescriptor {
        HotkeyDescriptor {
            hotkey_id: id.to_string(),
            name: name.to_string(),
            kind: "ToggleExpression".to_string(),
            model_id: "a".to_string(),
        }
    }

    #[test]
    fn hotkeys_are_replaced_not_merged() {
        let mut catalog = Catalog::default();
        catalog.apply(CatalogUpdate::Hotkeys {
            model_id: Some("a".to_string()),
            hotkeys: vec![hotkey("1", "Wave"), hotkey("2", "Smile")],
        });
        catalog.apply(CatalogUpdate::Hotkeys {
            model_id: Some("b".to_string()),
            hotkeys: vec![hotkey("3", "Blink")],
        });
        let ids: Vec<_> = catalog.hotkeys().map(|h| h.hotkey_id.as_str()).collect();
        assert_eq!(ids, vec!["3"]);
        assert_eq!(catalog.hotkeys_model_id(), Some("b"));
    }

    #[test]
    fn invalidate_keeps_data_but_marks_stale() {
        let mut catalog = Catalog::default();
        assert!(catalog.is_stale());
        for update in [
            CatalogUpdate::CurrentModel(None),
            CatalogUpdate::AvailableModels(vec![]),
            CatalogUpdate::Hotkeys {
                model_id: None,
                hotkeys: vec![hotkey("1", "Wave")],
            },
        ] {
            catalog.apply(update);
        }
        assert!(!catalog.is_stale());

        catalog.invalidate();
        assert!(catalog.is_stale());
        assert!(catalog.is_kind_stale(CatalogKind::Hotkeys));
        assert_eq!(catalog.hotkeys().count(), 1);
    }
}
