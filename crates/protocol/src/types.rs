//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fallback host key for records without a hostname
pub const UNKNOWN_HOST: &str = "Unknown Host";

/// Fallback project key for records without a project context
pub const UNGROUPED_CONTEXT: &str = "ungrouped";

/// Fallback session key for records without a session id
pub const UNKNOWN_SESSION: &str = "unknown-session";

/// One received hook notification, normalized for storage and grouping.
///
/// Records are immutable once stored. Field names serialize in camelCase so the
/// persisted collection keeps the dashboard's storage layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub message: String,
    /// Event-origin time (ISO 8601)
    pub timestamp: String,
    /// Client receipt time (ISO 8601)
    pub added_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl NotificationRecord {
    /// Host grouping key, falling back to [`UNKNOWN_HOST`].
    pub fn host_key(&self) -> &str {
        non_empty(self.hostname.as_deref()).unwrap_or(UNKNOWN_HOST)
    }

    /// Project grouping key, falling back to [`UNGROUPED_CONTEXT`].
    pub fn context_key(&self) -> &str {
        non_empty(self.project_context.as_deref()).unwrap_or(UNGROUPED_CONTEXT)
    }

    /// Session grouping key, falling back to [`UNKNOWN_SESSION`].
    pub fn session_key(&self) -> &str {
        non_empty(self.session_id.as_deref()).unwrap_or(UNKNOWN_SESSION)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
