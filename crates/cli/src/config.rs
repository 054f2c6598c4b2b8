//! Configuration resolution.
//!
//! Per field: CLI flag > environment (clap `env`) > `<data_dir>/config.toml` >
//! built-in default. The access token never lives in the config file; it
//! comes from `--token`/`HOOKWATCH_TOKEN` or the `auth-token` file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use hookwatch_client::auth::token_from_file;
use hookwatch_client::paths;
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Data directory [default: ~/.hookwatch]
    #[arg(long, env = "HOOKWATCH_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Backend API base URL
    #[arg(long, env = "HOOKWATCH_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "HOOKWATCH_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,
}

/// `config.toml` contents
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// A missing file is an empty config; an unreadable or invalid one is an
    /// error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl Config {
    /// Resolve the data dir, then everything that derives from it.
    pub fn load(args: &GlobalArgs) -> anyhow::Result<Self> {
        let data_dir = paths::init_data_dir(args.data_dir.as_deref());
        let file = FileConfig::load(&paths::config_path())?;
        let file_token = token_from_file(&paths::token_file_path());
        Ok(Self::from_parts(data_dir, args, file, file_token))
    }

    pub fn from_parts(
        data_dir: PathBuf,
        args: &GlobalArgs,
        file: FileConfig,
        file_token: Option<String>,
    ) -> Self {
        let base_url = args
            .base_url
            .clone()
            .or(file.base_url)
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let token = args
            .token
            .clone()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or(file_token);

        let request_timeout = Duration::from_secs(
            file.request_timeout_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );

        Self {
            data_dir,
            base_url,
            token,
            request_timeout,
        }
    }

    pub fn require_token(&self) -> anyhow::Result<&str> {
        self.token.as_deref().with_context(|| {
            format!(
                "no access token: pass --token, set HOOKWATCH_TOKEN or write {}",
                self.data_dir.join("auth-token").display()
            )
        })
    }
}
