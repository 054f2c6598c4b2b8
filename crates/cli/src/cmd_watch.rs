//! `hookwatch watch`: connect and live-render the grouped notifications.

use std::sync::Arc;

use console::{style, Term};
use hookwatch_client::{
    paths, AuthSession, Credentials, Dashboard, HookApi, HttpApi, SqliteStorage,
};
use tracing::info;

use crate::config::Config;
use crate::render::{render_status, render_tree};

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let token = config.require_token()?.to_string();
    let api = Arc::new(HttpApi::new(&config.base_url)?.with_request_timeout(config.request_timeout));
    let storage = Arc::new(SqliteStorage::open(&paths::db_path())?);
    let dashboard = Dashboard::new(api, AuthSession::new(Credentials::bearer(token)), storage);

    if let Some(err) = dashboard.store().error() {
        eprintln!("  {} {err}", style("warning:").yellow());
    }

    info!(
        component = "cli",
        event = "cli.watch_started",
        base_url = %config.base_url,
    );

    let term = Term::stdout();
    let mut revisions = dashboard.store().subscribe();
    let mut status = dashboard.manager().subscribe();

    let started = tokio::select! {
        result = dashboard.start() => result,
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };
    if let Err(e) = started {
        anyhow::bail!("user initialization failed: {e}");
    }

    redraw(&term, &dashboard)?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        redraw(&term, &dashboard)?;
    }

    // Ctrl-C is the unload signal
    dashboard.unload().await;
    info!(component = "cli", event = "cli.watch_stopped");
    Ok(())
}

fn redraw<A: HookApi>(term: &Term, dashboard: &Dashboard<A>) -> std::io::Result<()> {
    term.clear_screen()?;
    term.write_line(&format!(
        "hookwatch  {}  {}",
        render_status(&dashboard.manager().state()),
        style(format!("{} stored", dashboard.store().len())).dim()
    ))?;
    term.write_line("")?;
    term.write_str(&render_tree(&dashboard.groups(), dashboard.expansion()))?;
    term.write_line(&format!("\n{}", style("Ctrl-C to quit").dim()))?;
    Ok(())
}
