//! Configuration system for the `MarketChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/marketchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::chat::SessionConfig;
use crate::chat::retry::RetryPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    session: SessionFileConfig,
    chat: ChatFileConfig,
    connectivity: ConnectivityFileConfig,
    ui: UiFileConfig,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<String>,
    display_name: Option<String>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    denorm_retry_interval_secs: Option<u64>,
    warning_buffer: Option<usize>,
}

/// `[connectivity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectivityFileConfig {
    settle_delay_ms: Option<u64>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
    poll_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Session --
    /// User to sign in as at startup.
    pub user_id: Option<String>,
    /// Display name for the startup user.
    pub display_name: Option<String>,

    // -- Chat --
    /// Re-subscribe attempts before falling back to a one-shot fetch.
    pub retry_attempts: u32,
    /// Linear backoff step between re-subscribe attempts.
    pub retry_base_delay: Duration,
    /// How often failed preview/unread writes are retried.
    pub denorm_retry_interval: Duration,
    /// Capacity of the preview-failure warning channel.
    pub warning_buffer: usize,

    // -- Connectivity --
    /// Delay before re-enabling the network after returning to the foreground.
    pub settle_delay: Duration,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
    /// How often the front end checks for live updates.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            display_name: None,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            denorm_retry_interval: Duration::from_secs(30),
            warning_buffer: 64,
            settle_delay: Duration::from_millis(1500),
            timestamp_format: "%H:%M".to_string(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/marketchat/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` so it can be
    /// tested without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            user_id: cli
                .user
                .clone()
                .or_else(|| file.session.user_id.clone()),
            display_name: cli
                .name
                .clone()
                .or_else(|| file.session.display_name.clone()),
            retry_attempts: file
                .chat
                .retry_attempts
                .unwrap_or(defaults.retry_attempts),
            retry_base_delay: file
                .chat
                .retry_base_delay_ms
                .map_or(defaults.retry_base_delay, Duration::from_millis),
            denorm_retry_interval: file
                .chat
                .denorm_retry_interval_secs
                .map_or(defaults.denorm_retry_interval, Duration::from_secs),
            warning_buffer: file
                .chat
                .warning_buffer
                .unwrap_or(defaults.warning_buffer),
            settle_delay: file
                .connectivity
                .settle_delay_ms
                .map_or(defaults.settle_delay, Duration::from_millis),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
            poll_interval: file
                .ui
                .poll_interval_ms
                .map_or(defaults.poll_interval, Duration::from_millis),
        }
    }

    /// Returns the subscription retry policy described by this config.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
            ..RetryPolicy::default()
        }
    }

    /// Returns the per-session settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            retry: self.retry_policy(),
            denorm_retry_interval: self.denorm_retry_interval,
            warning_buffer: self.warning_buffer,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Listing-scoped marketplace chat")]
pub struct CliArgs {
    /// User id to sign in as at startup.
    #[arg(long, env = "MARKETCHAT_USER")]
    pub user: Option<String>,

    /// Display name for the startup user.
    #[arg(long, env = "MARKETCHAT_NAME")]
    pub name: Option<String>,

    /// Path to config file (default: `~/.config/marketchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MARKETCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/marketchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("marketchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
