use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::message::{GroupKey, Message};
use crate::core::store::GenerationGroup;
use crate::utils::kv::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDirection {
    Prev,
    Next,
}

/// Current on-disk document version. Version 1 maps predate the instance
/// index segment in group keys and are stored as a bare JSON object.
const NAV_DOC_VERSION: u32 = 2;

fn nav_storage_key(conversation_id: &str) -> String {
    format!("nav/{conversation_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct NavigationDocument {
    version: u32,
    entries: HashMap<String, Option<String>>,
}

/// Append the default instance index to group keys written before the key
/// schema gained one. Runs once, at load.
fn migrate_legacy_entries(
    legacy: HashMap<String, Option<String>>,
) -> HashMap<String, Option<String>> {
    legacy
        .into_iter()
        .map(|(key, value)| (format!("{key}:0"), value))
        .collect()
}

/// Tracks, per generation group, which generation is currently displayed.
///
/// A group is either "unset" (show the latest generation) or pinned to a
/// specific message id. The whole map is persisted per conversation on every
/// change; storage failures are logged and never block navigation.
pub struct GenerationNavigator {
    store: Arc<dyn KeyValueStore>,
    conversation_id: Option<String>,
    entries: HashMap<String, Option<String>>,
}

impl GenerationNavigator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            conversation_id: None,
            entries: HashMap::new(),
        }
    }

    /// Load (and, for legacy documents, migrate) the navigation map for a
    /// conversation, replacing whatever was loaded before.
    pub fn load(&mut self, conversation_id: &str) {
        self.conversation_id = Some(conversation_id.to_string());
        self.entries.clear();

        let raw = match self.store.get(&nav_storage_key(conversation_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to load navigation state for {conversation_id}: {e}");
                return;
            }
        };

        if let Ok(doc) = serde_json::from_str::<NavigationDocument>(&raw) {
            self.entries = doc.entries;
            return;
        }

        // Legacy shape: a bare map whose keys lack the instance index.
        match serde_json::from_str::<HashMap<String, Option<String>>>(&raw) {
            Ok(legacy) => {
                debug!(
                    "migrating {} legacy navigation entries for {conversation_id}",
                    legacy.len()
                );
                self.entries = migrate_legacy_entries(legacy);
                self.persist();
            }
            Err(e) => {
                warn!("discarding unreadable navigation state for {conversation_id}: {e}");
            }
        }
    }

    fn persist(&self) {
        let Some(conversation_id) = &self.conversation_id else {
            return;
        };
        let doc = NavigationDocument {
            version: NAV_DOC_VERSION,
            entries: self.entries.clone(),
        };
        let serialized = match serde_json::to_string(&doc) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!("failed to serialize navigation state: {e}");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&nav_storage_key(conversation_id), &serialized)
        {
            warn!("failed to persist navigation state for {conversation_id}: {e}");
        }
    }

    /// The generation currently displayed for a group: the pinned one when
    /// it still exists, otherwise the latest.
    pub fn current<'a>(&self, group: &'a GenerationGroup) -> Option<&'a Message> {
        let pinned = self
            .entries
            .get(&group.key.storage_key())
            .and_then(|v| v.as_deref());
        if let Some(id) = pinned {
            if let Some(index) = group.position_of(id) {
                return group.generations.get(index);
            }
        }
        group.latest()
    }

    /// Pin a group to a freshly created generation (a retry result).
    pub fn pin_retry(&mut self, key: &GroupKey, new_message_id: &str) {
        self.entries
            .insert(key.storage_key(), Some(new_message_id.to_string()));
        self.persist();
    }

    /// Step through a group's generations with wrap-around in both
    /// directions. Returns the id now displayed, or None for an empty group.
    pub fn navigate(
        &mut self,
        group: &GenerationGroup,
        direction: NavigationDirection,
    ) -> Option<String> {
        if group.generations.is_empty() {
            return None;
        }

        let len = group.generations.len();
        let current_index = self
            .entries
            .get(&group.key.storage_key())
            .and_then(|v| v.as_deref())
            .and_then(|id| group.position_of(id))
            .unwrap_or(len - 1);

        let next_index = match direction {
            NavigationDirection::Next => (current_index + 1) % len,
            NavigationDirection::Prev => (current_index + len - 1) % len,
        };

        let id = group.generations[next_index].id.clone();
        self.entries.insert(group.key.storage_key(), Some(id.clone()));
        self.persist();
        Some(id)
    }

    /// Pinned message id for a group key, if any.
    pub fn pinned(&self, key: &GroupKey) -> Option<&str> {
        self.entries
            .get(&key.storage_key())
            .and_then(|v| v.as_deref())
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &HashMap<String, Option<String>> {
        &self.entries
    }
}
