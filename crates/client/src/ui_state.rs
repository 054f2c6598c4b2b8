//! Per-group expand/collapse flags.
//!
//! Each group id (see [`crate::grouping`]) gets its own storage key. The
//! notification collection key is never touched here.

use std::sync::Arc;

use tracing::warn;

use crate::storage::{Storage, StorageError};

const KEY_PREFIX: &str = "group-expanded:";

pub fn expansion_key(group_id: &str) -> String {
    format!("{KEY_PREFIX}{group_id}")
}

pub struct ExpansionState {
    storage: Arc<dyn Storage>,
    default_expanded: bool,
}

impl ExpansionState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            default_expanded: true,
        }
    }

    pub fn with_default(mut self, expanded: bool) -> Self {
        self.default_expanded = expanded;
        self
    }

    /// Unknown ids, unreadable values and storage failures all read as the
    /// default.
    pub fn is_expanded(&self, group_id: &str) -> bool {
        match self.storage.get(&expansion_key(group_id)) {
            Ok(Some(value)) => value.parse().unwrap_or(self.default_expanded),
            Ok(None) => self.default_expanded,
            Err(e) => {
                warn!(
                    component = "ui_state",
                    event = "ui_state.read_failed",
                    group_id,
                    error = %e,
                );
                self.default_expanded
            }
        }
    }

    pub fn set_expanded(&self, group_id: &str, expanded: bool) -> Result<(), StorageError> {
        self.storage
            .set(&expansion_key(group_id), if expanded { "true" } else { "false" })
    }

    /// Flip and return the new value.
    pub fn toggle(&self, group_id: &str) -> Result<bool, StorageError> {
        let expanded = !self.is_expanded(group_id);
        self.set_expanded(group_id, expanded)?;
        Ok(expanded)
    }

    pub fn reset(&self, group_id: &str) -> Result<(), StorageError> {
        self.storage.remove(&expansion_key(group_id))
    }
}
