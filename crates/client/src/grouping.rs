//! Three-level grouping: host → project → session.
//!
//! [`group`] is a pure, total recomputation over the store snapshot. Every
//! level carries the descendant record count and the latest descendant
//! timestamp, and every level is sorted newest activity first.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use hookwatch_protocol::{NotificationRecord, UNGROUPED_CONTEXT, UNKNOWN_SESSION};

const GENERAL_PROJECT: &str = "General";
const UNKNOWN_SESSION_DISPLAY: &str = "Unknown Session";
const SESSION_DISPLAY_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct HostGroup {
    /// Stable id for UI state, `host:<key>`
    pub id: String,
    pub key: String,
    pub display_name: String,
    pub count: usize,
    pub latest_timestamp: String,
    pub projects: Vec<ProjectGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectGroup {
    /// `project:<host>/<context>`
    pub id: String,
    pub key: String,
    pub display_name: String,
    pub count: usize,
    pub latest_timestamp: String,
    pub sessions: Vec<SessionGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionGroup {
    /// `session:<host>/<context>/<session>`
    pub id: String,
    pub key: String,
    pub display_name: String,
    pub count: usize,
    pub latest_timestamp: String,
    /// Newest first
    pub notifications: Vec<NotificationRecord>,
}

/// Sort key for a timestamp: the parsed instant, then the raw string.
/// Unparseable timestamps order before every parseable one.
fn timestamp_key(ts: &str) -> (Option<DateTime<FixedOffset>>, &str) {
    (DateTime::parse_from_rfc3339(ts).ok(), ts)
}

/// Total order over ISO 8601 timestamps: instants when both parse, raw
/// strings when neither does, unparseable before parseable otherwise.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    timestamp_key(a).cmp(&timestamp_key(b))
}

fn latest<'a>(timestamps: impl Iterator<Item = &'a str>) -> String {
    timestamps
        .max_by(|a, b| compare_timestamps(a, b))
        .unwrap_or_default()
        .to_string()
}

/// Newest first; equal timestamps order by key so output is deterministic.
fn by_recency(a_ts: &str, a_key: &str, b_ts: &str, b_key: &str) -> Ordering {
    compare_timestamps(b_ts, a_ts).then_with(|| a_key.cmp(b_key))
}

pub fn group(records: &[NotificationRecord]) -> Vec<HostGroup> {
    let mut hosts: BTreeMap<&str, BTreeMap<&str, BTreeMap<&str, Vec<&NotificationRecord>>>> =
        BTreeMap::new();
    for record in records {
        hosts
            .entry(record.host_key())
            .or_default()
            .entry(record.context_key())
            .or_default()
            .entry(record.session_key())
            .or_default()
            .push(record);
    }

    let mut groups: Vec<HostGroup> = hosts
        .into_iter()
        .map(|(host, projects)| build_host(host, projects))
        .collect();
    groups.sort_by(|a, b| by_recency(&a.latest_timestamp, &a.key, &b.latest_timestamp, &b.key));
    groups
}

fn build_host(
    host: &str,
    projects: BTreeMap<&str, BTreeMap<&str, Vec<&NotificationRecord>>>,
) -> HostGroup {
    let mut projects: Vec<ProjectGroup> = projects
        .into_iter()
        .map(|(context, sessions)| build_project(host, context, sessions))
        .collect();
    projects.sort_by(|a, b| by_recency(&a.latest_timestamp, &a.key, &b.latest_timestamp, &b.key));

    HostGroup {
        id: format!("host:{host}"),
        key: host.to_string(),
        display_name: host.to_string(),
        count: projects.iter().map(|p| p.count).sum(),
        latest_timestamp: latest(projects.iter().map(|p| p.latest_timestamp.as_str())),
        projects,
    }
}

fn build_project(
    host: &str,
    context: &str,
    sessions: BTreeMap<&str, Vec<&NotificationRecord>>,
) -> ProjectGroup {
    let mut sessions: Vec<SessionGroup> = sessions
        .into_iter()
        .map(|(session, records)| build_session(host, context, session, records))
        .collect();
    sessions.sort_by(|a, b| by_recency(&a.latest_timestamp, &a.key, &b.latest_timestamp, &b.key));

    ProjectGroup {
        id: format!("project:{host}/{context}"),
        key: context.to_string(),
        display_name: project_display_name(context),
        count: sessions.iter().map(|s| s.count).sum(),
        latest_timestamp: latest(sessions.iter().map(|s| s.latest_timestamp.as_str())),
        sessions,
    }
}

fn build_session(
    host: &str,
    context: &str,
    session: &str,
    records: Vec<&NotificationRecord>,
) -> SessionGroup {
    let mut notifications: Vec<NotificationRecord> = records.into_iter().cloned().collect();
    // Stable: equal timestamps keep store order (newest received first)
    notifications.sort_by(|a, b| compare_timestamps(&b.timestamp, &a.timestamp));

    SessionGroup {
        id: format!("session:{host}/{context}/{session}"),
        key: session.to_string(),
        display_name: session_display_name(session),
        count: notifications.len(),
        latest_timestamp: latest(notifications.iter().map(|n| n.timestamp.as_str())),
        notifications,
    }
}

/// Human-friendly project name from a context path.
///
/// `/home/me/my-cool_project.rs` becomes `My Cool Project Rs`. The ungrouped
/// sentinel and empty paths become `General`.
pub fn project_display_name(context: &str) -> String {
    let trimmed = context.trim().trim_end_matches(['/', '\\']);
    if trimmed.is_empty() || trimmed == UNGROUPED_CONTEXT {
        return GENERAL_PROJECT.to_string();
    }

    let segment = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let spaced: String = segment
        .chars()
        .map(|c| if matches!(c, '-' | '_' | '.') { ' ' } else { c })
        .collect();
    let words: Vec<String> = spaced.split_whitespace().map(title_case).collect();

    if words.is_empty() {
        GENERAL_PROJECT.to_string()
    } else {
        words.join(" ")
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn session_display_name(session: &str) -> String {
    if session == UNKNOWN_SESSION {
        UNKNOWN_SESSION_DISPLAY.to_string()
    } else {
        session.chars().take(SESSION_DISPLAY_LEN).collect()
    }
}
