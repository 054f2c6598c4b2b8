//! Central path resolution for hookwatch data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `HOOKWATCH_DATA_DIR` env > `~/.hookwatch`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

pub const DATA_DIR_ENV: &str = "HOOKWATCH_DATA_DIR";

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `HOOKWATCH_DATA_DIR` env > `~/.hookwatch` default.
/// Without a home directory the default falls back to `./.hookwatch`.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var(DATA_DIR_ENV) {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hookwatch")
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory, resolving the default on first use.
pub fn data_dir() -> PathBuf {
    let current = DATA_DIR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match current {
        Some(dir) => dir,
        None => init_data_dir(None),
    }
}

pub fn db_path() -> PathBuf {
    data_dir().join("hookwatch.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("auth-token")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
