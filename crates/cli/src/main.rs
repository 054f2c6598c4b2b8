//! hookwatch
//!
//! Terminal dashboard for hook notifications streamed from the hooks backend.

mod cmd_backend;
mod cmd_store;
mod cmd_watch;
mod config;
mod logging;
mod render;

use clap::{ArgGroup, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use hookwatch_client::paths;
use tracing::info;

use crate::cmd_store::DeleteTarget;
use crate::config::{Config, GlobalArgs};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hookwatch", version, about = "Watch hook notifications grouped by host, project and session")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the event stream and render notifications live
    Watch,

    /// Print the stored notifications as a tree
    Tree {
        /// Ignore collapsed groups
        #[arg(long)]
        all: bool,
    },

    /// Summarize stored notifications per host
    Hosts,

    /// Delete stored notifications
    #[command(group(
        ArgGroup::new("target")
            .required(true)
            .args(["id", "host", "context", "session"])
    ))]
    Delete {
        /// Notification id
        id: Option<String>,

        /// Every notification from this host ("Unknown Host" for none)
        #[arg(long)]
        host: Option<String>,

        /// Every notification from this project path ("ungrouped" for none)
        #[arg(long)]
        context: Option<String>,

        /// Every notification from this session ("unknown-session" for none)
        #[arg(long)]
        session: Option<String>,
    },

    /// Delete every stored notification
    Purge {
        /// Confirmation phrase, prompted for when absent
        #[arg(long, value_name = "PHRASE")]
        confirm: Option<String>,
    },

    /// Run the user initialization handshake
    Init,

    /// Ask the backend to drop a stream connection
    Disconnect {
        connection_id: String,
    },

    /// Expand a group in the tree
    Expand {
        /// Group id, e.g. `host:laptop` or `project:laptop//home/me/app`
        group_id: String,
    },

    /// Collapse a group in the tree
    Collapse {
        group_id: String,
    },

    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "hookwatch", &mut std::io::stdout());
        return Ok(());
    }

    let config = Config::load(&cli.global)?;
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir())?;
    info!(
        component = "cli",
        event = "cli.started",
        version = VERSION,
        run_id = %logging.run_id,
        data_dir = %config.data_dir.display(),
    );

    match cli.command {
        Command::Watch => cmd_watch::run(&config).await,
        Command::Tree { all } => cmd_store::tree(all),
        Command::Hosts => cmd_store::hosts(),
        Command::Delete {
            id,
            host,
            context,
            session,
        } => match DeleteTarget::from_args(id, host, context, session) {
            Some(target) => cmd_store::delete(target),
            None => anyhow::bail!("nothing to delete"),
        },
        Command::Purge { confirm } => cmd_store::purge(confirm),
        Command::Init => cmd_backend::init(&config).await,
        Command::Disconnect { connection_id } => {
            cmd_backend::disconnect(&config, &connection_id).await
        }
        Command::Expand { group_id } => cmd_store::set_expanded(&group_id, true),
        Command::Collapse { group_id } => cmd_store::set_expanded(&group_id, false),
        Command::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn delete_requires_a_target() {
        assert!(Cli::try_parse_from(["hookwatch", "delete"]).is_err());
        assert!(Cli::try_parse_from(["hookwatch", "delete", "e1", "--host", "A"]).is_err());

        let cli = Cli::try_parse_from(["hookwatch", "delete", "--session", "s1"]).unwrap();
        let Command::Delete { session, id, .. } = cli.command else {
            panic!("expected delete");
        };
        assert_eq!(session.as_deref(), Some("s1"));
        assert_eq!(id, None);
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hookwatch",
            "tree",
            "--base-url",
            "http://x/api",
            "--data-dir",
            "/tmp/hw",
        ])
        .unwrap();
        assert_eq!(cli.global.base_url.as_deref(), Some("http://x/api"));
        assert_eq!(
            cli.global.data_dir.as_deref(),
            Some(std::path::Path::new("/tmp/hw"))
        );
    }

    #[test]
    fn purge_accepts_phrase_flag() {
        let cli = Cli::try_parse_from(["hookwatch", "purge", "--confirm", "DELETE ALL"]).unwrap();
        let Command::Purge { confirm } = cli.command else {
            panic!("expected purge");
        };
        assert!(cmd_store::is_purge_confirmed(&confirm.unwrap()));
    }
}
