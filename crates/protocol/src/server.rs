//! Server → Client stream events
//!
//! The events endpoint is a text/event-stream. Each frame carries an `event:`
//! name and a JSON `data:` payload; only the names below are understood.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::NotificationRecord;

/// Frame name for hook notifications
pub const HOOK_EVENT: &str = "claude-hook";

/// Frame name for the stream confirmation carrying the connection id
pub const CONNECTED_EVENT: &str = "connected";

/// A typed event decoded from one SSE frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Hook(HookPayload),
    Connected(ConnectedPayload),
}

impl StreamEvent {
    /// Decode a frame. Unrecognized event names yield `Ok(None)`.
    pub fn from_frame(event: Option<&str>, data: &str) -> Result<Option<Self>, serde_json::Error> {
        match event {
            Some(HOOK_EVENT) => serde_json::from_str(data).map(|p| Some(Self::Hook(p))),
            Some(CONNECTED_EVENT) => serde_json::from_str(data).map(|p| Some(Self::Connected(p))),
            _ => Ok(None),
        }
    }
}

/// Payload of a `connected` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub connection_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of a `claude-hook` frame.
///
/// Only `id`, `reason` and `timestamp` are guaranteed. Hook and telemetry
/// fields vary by hook type and are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    pub id: String,
    pub reason: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const HOSTNAME_KEYS: &[&str] = &["hostname", "host"];
const CONTEXT_KEYS: &[&str] = &["context", "project_context", "cwd"];
const SESSION_KEYS: &[&str] = &["session_id", "sessionId"];
const HOOK_TYPE_KEYS: &[&str] = &["hook_type", "hook_event_name", "hookType"];

impl HookPayload {
    /// Normalize into a stored record received at `added_at`.
    ///
    /// Grouping fields are taken from the top level first, then from a nested
    /// `metadata` object. Everything not consumed is kept as record metadata.
    pub fn into_record(mut self, added_at: impl Into<String>) -> NotificationRecord {
        let hostname = self.take_string(HOSTNAME_KEYS);
        let project_context = self.take_string(CONTEXT_KEYS);
        let session_id = self.take_string(SESSION_KEYS);
        let hook_type = self.take_string(HOOK_TYPE_KEYS);

        NotificationRecord {
            id: self.id,
            message: self.reason,
            timestamp: self.timestamp,
            added_at: added_at.into(),
            hostname,
            project_context,
            session_id,
            hook_type,
            metadata: self.extra,
        }
    }

    fn take_string(&mut self, keys: &[&str]) -> Option<String> {
        for key in keys {
            if matches!(self.extra.get(*key), Some(Value::String(s)) if !s.trim().is_empty()) {
                if let Some(Value::String(s)) = self.extra.remove(*key) {
                    return Some(s);
                }
            }
        }

        let nested = self.extra.get("metadata").and_then(Value::as_object)?;
        keys.iter()
            .filter_map(|key| nested.get(*key).and_then(Value::as_str))
            .find(|s| !s.trim().is_empty())
            .map(str::to_string)
    }
}
