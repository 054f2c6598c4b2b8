//! Terminal rendering for groups and connection status.

use std::fmt::Write;

use chrono::{DateTime, Local};
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, ContentArrangement, Table};
use console::style;
use hookwatch_client::grouping::HostGroup;
use hookwatch_client::{ConnectionState, ExpansionState, Phase};
use hookwatch_protocol::NotificationRecord;

/// Anything that answers "is this group open?"
pub trait Expansion {
    fn is_expanded(&self, group_id: &str) -> bool;
}

impl Expansion for ExpansionState {
    fn is_expanded(&self, group_id: &str) -> bool {
        ExpansionState::is_expanded(self, group_id)
    }
}

/// Every group open
pub struct AllExpanded;

impl Expansion for AllExpanded {
    fn is_expanded(&self, _group_id: &str) -> bool {
        true
    }
}

fn marker(expanded: bool) -> &'static str {
    if expanded {
        "▾"
    } else {
        "▸"
    }
}

/// Short local time for an ISO timestamp; unparseable input is shown as is.
pub fn short_time(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(ts) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => timestamp.to_string(),
    }
}

fn notification_line(record: &NotificationRecord) -> String {
    let hook = record
        .hook_type
        .as_deref()
        .map(|h| format!("[{h}] "))
        .unwrap_or_default();
    format!(
        "{} {}{}",
        style(short_time(&record.timestamp)).dim(),
        style(hook).cyan(),
        record.message
    )
}

pub fn render_tree(groups: &[HostGroup], expansion: &dyn Expansion) -> String {
    let mut out = String::new();
    if groups.is_empty() {
        let _ = writeln!(out, "  {}", style("No notifications yet.").dim());
        return out;
    }

    for host in groups {
        let open = expansion.is_expanded(&host.id);
        let _ = writeln!(
            out,
            "{} {}  {}  {}",
            marker(open),
            style(&host.display_name).bold(),
            style(format!("({})", host.count)).yellow(),
            style(short_time(&host.latest_timestamp)).dim(),
        );
        if !open {
            continue;
        }

        for project in &host.projects {
            let open = expansion.is_expanded(&project.id);
            let _ = writeln!(
                out,
                "  {} {}  {}  {}",
                marker(open),
                style(&project.display_name).green(),
                style(format!("({})", project.count)).yellow(),
                style(&project.key).dim(),
            );
            if !open {
                continue;
            }

            for session in &project.sessions {
                let open = expansion.is_expanded(&session.id);
                let _ = writeln!(
                    out,
                    "    {} {}  {}",
                    marker(open),
                    style(&session.display_name).magenta(),
                    style(format!("({})", session.count)).yellow(),
                );
                if !open {
                    continue;
                }
                for record in &session.notifications {
                    let _ = writeln!(out, "      • {}", notification_line(record));
                }
            }
        }
    }
    out
}

pub fn render_hosts(groups: &[HostGroup]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Host", "Projects", "Sessions", "Notifications", "Latest"]);

    for host in groups {
        let sessions: usize = host.projects.iter().map(|p| p.sessions.len()).sum();
        table.add_row(vec![
            Cell::new(&host.display_name),
            Cell::new(host.projects.len()),
            Cell::new(sessions),
            Cell::new(host.count),
            Cell::new(short_time(&host.latest_timestamp)),
        ]);
    }
    table.to_string()
}

pub fn render_status(state: &ConnectionState) -> String {
    match state.phase {
        Phase::Idle => format!("{} idle", style("○").dim()),
        Phase::Connecting if state.reconnect_attempts > 0 => format!(
            "{} reconnecting (attempt {})",
            style("◌").yellow(),
            state.reconnect_attempts
        ),
        Phase::Connecting => format!("{} connecting", style("◌").yellow()),
        Phase::Connected => match &state.connection_id {
            Some(id) => format!("{} connected ({id})", style("●").green()),
            None => format!("{} connected", style("●").green()),
        },
        Phase::Error => {
            let reason = state
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown error".to_string());
            if state.is_terminal() {
                format!("{} {reason}", style("✗").red())
            } else {
                format!("{} {reason}, retrying", style("✗").yellow())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwatch_client::group;
    use hookwatch_client::StreamError;
    use serde_json::Map;

    struct Collapsed(&'static str);

    impl Expansion for Collapsed {
        fn is_expanded(&self, group_id: &str) -> bool {
            group_id != self.0
        }
    }

    fn record(id: &str, host: &str, context: &str) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            message: format!("message {id}"),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            added_at: "2024-01-01T00:00:00Z".to_string(),
            hostname: Some(host.to_string()),
            project_context: Some(context.to_string()),
            session_id: Some("session-1234567890".to_string()),
            hook_type: Some("Stop".to_string()),
            metadata: Map::new(),
        }
    }

    fn plain() {
        console::set_colors_enabled(false);
    }

    #[test]
    fn tree_shows_every_level() {
        plain();
        let groups = group(&[record("1", "laptop", "/w/hook-watch")]);
        let out = render_tree(&groups, &AllExpanded);

        assert!(out.contains("▾ laptop  (1)"));
        assert!(out.contains("▾ Hook Watch  (1)  /w/hook-watch"));
        assert!(out.contains("▾ session-  (1)"));
        assert!(out.contains("[Stop] message 1"));
    }

    #[test]
    fn collapsed_group_hides_children() {
        plain();
        let groups = group(&[record("1", "laptop", "/w/p")]);
        let out = render_tree(&groups, &Collapsed("host:laptop"));

        assert!(out.contains("▸ laptop"));
        assert!(!out.contains("message 1"));
    }

    #[test]
    fn empty_tree_says_so() {
        plain();
        assert!(render_tree(&[], &AllExpanded).contains("No notifications yet."));
    }

    #[test]
    fn hosts_table_lists_counts() {
        let groups = group(&[
            record("1", "laptop", "/w/a"),
            record("2", "laptop", "/w/b"),
            record("3", "server", "/w/a"),
        ]);
        let out = render_hosts(&groups);
        assert!(out.contains("laptop"));
        assert!(out.contains("server"));
        assert!(out.contains("Notifications"));
    }

    #[test]
    fn status_lines() {
        plain();
        assert!(render_status(&ConnectionState::default()).contains("idle"));

        let connected = ConnectionState {
            phase: Phase::Connected,
            connection_id: Some("abc".into()),
            ..Default::default()
        };
        assert!(render_status(&connected).contains("connected (abc)"));

        let retrying = ConnectionState {
            phase: Phase::Error,
            reconnect_attempts: 2,
            error: Some(StreamError::Connection {
                reason: "HTTP 502".into(),
            }),
            connection_id: None,
        };
        assert!(render_status(&retrying).ends_with("retrying"));

        let terminal = ConnectionState {
            phase: Phase::Error,
            error: Some(StreamError::Authentication { status: 401 }),
            ..Default::default()
        };
        assert!(!render_status(&terminal).contains("retrying"));
    }
}
