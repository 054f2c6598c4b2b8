//! Local store commands: `tree`, `hosts`, `delete`, `purge`, `expand`,
//! `collapse`.

use std::sync::Arc;

use anyhow::Context;
use console::{style, Term};
use hookwatch_client::{
    group, paths, ExpansionState, NotificationStore, SqliteStorage, Storage,
};

use crate::render::{render_hosts, render_tree, AllExpanded};

/// Phrase `purge` requires before it touches the store.
pub const PURGE_PHRASE: &str = "DELETE ALL";

/// What `delete` removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    One(String),
    Host(String),
    Context(String),
    Session(String),
}

impl DeleteTarget {
    pub fn from_args(
        id: Option<String>,
        host: Option<String>,
        context: Option<String>,
        session: Option<String>,
    ) -> Option<Self> {
        id.map(Self::One)
            .or_else(|| host.map(Self::Host))
            .or_else(|| context.map(Self::Context))
            .or_else(|| session.map(Self::Session))
    }

    fn apply(&self, store: &NotificationStore) -> usize {
        match self {
            DeleteTarget::One(id) => store.delete_one(id),
            DeleteTarget::Host(host) => store.delete_by_host(host),
            DeleteTarget::Context(context) => store.delete_by_context(context),
            DeleteTarget::Session(session) => store.delete_by_session(session),
        }
    }
}

pub fn is_purge_confirmed(input: &str) -> bool {
    input.trim() == PURGE_PHRASE
}

fn open_storage() -> anyhow::Result<Arc<dyn Storage>> {
    let path = paths::db_path();
    let storage = SqliteStorage::open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(storage))
}

fn open_store() -> anyhow::Result<NotificationStore> {
    let store = NotificationStore::open(open_storage()?);
    if let Some(err) = store.error() {
        eprintln!("  {} {err}", style("warning:").yellow());
    }
    Ok(store)
}

pub fn tree(all: bool) -> anyhow::Result<()> {
    let storage = open_storage()?;
    let store = NotificationStore::open(storage.clone());
    let groups = group(&store.snapshot());

    let out = if all {
        render_tree(&groups, &AllExpanded)
    } else {
        render_tree(&groups, &ExpansionState::new(storage))
    };
    print!("{out}");
    Ok(())
}

pub fn hosts() -> anyhow::Result<()> {
    let store = open_store()?;
    let groups = group(&store.snapshot());
    if groups.is_empty() {
        println!("  No notifications stored.");
        return Ok(());
    }
    println!("{}", render_hosts(&groups));
    Ok(())
}

pub fn delete(target: DeleteTarget) -> anyhow::Result<()> {
    let store = open_store()?;
    let removed = target.apply(&store);
    println!("  Deleted {removed} notification(s).");
    if let Some(err) = store.error() {
        anyhow::bail!("deleted in memory but not saved: {err}");
    }
    Ok(())
}

pub fn purge(confirm: Option<String>) -> anyhow::Result<()> {
    let store = open_store()?;
    if store.is_empty() {
        println!("  Nothing to purge.");
        return Ok(());
    }

    let answer = match confirm {
        Some(answer) => answer,
        None => {
            println!(
                "  This removes all {} stored notifications. Type {} to confirm:",
                store.len(),
                style(PURGE_PHRASE).bold()
            );
            Term::stdout().read_line()?
        }
    };

    if !is_purge_confirmed(&answer) {
        println!("  Purge cancelled.");
        return Ok(());
    }

    let removed = store.delete_all();
    println!("  Purged {removed} notification(s).");
    if let Some(err) = store.error() {
        anyhow::bail!("purged in memory but not saved: {err}");
    }
    Ok(())
}

pub fn set_expanded(group_id: &str, expanded: bool) -> anyhow::Result<()> {
    ExpansionState::new(open_storage()?).set_expanded(group_id, expanded)?;
    println!(
        "  {} {group_id}",
        if expanded { "Expanded" } else { "Collapsed" }
    );
    Ok(())
}
