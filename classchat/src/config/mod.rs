//! Configuration for the `classchat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/classchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use classchat_proto::message::{ThreadId, UserId};

use crate::connection::ReconnectConfig;
use crate::realtime::ws::WsTimeouts;
use crate::typing::TypingConfig;

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

    /// A duration that drives a timer was set to zero.
    #[error("config value {key} must be greater than zero")]
    ZeroDuration {
        /// Dotted key, e.g. `typing.sweep_interval_ms`.
        key: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    hub: HubFileConfig,
    typing: TypingFileConfig,
    reconnect: ReconnectFileConfig,
    ui: UiFileConfig,
}

/// `[hub]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HubFileConfig {
    url: Option<String>,
    user_id: Option<String>,
    user_name: Option<String>,
    connect_timeout_secs: Option<u64>,
    hello_timeout_secs: Option<u64>,
    rpc_timeout_secs: Option<u64>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    throttle_ms: Option<u64>,
    timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    stale_grace_ms: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    /// `0` retries forever.
    max_attempts: Option<u32>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Who to connect as, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Hub WebSocket URL.
    pub hub_url: String,
    /// Local user id.
    pub user_id: UserId,
    /// Display name sent with typing signals and messages.
    pub user_name: String,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Hub --
    /// Hub WebSocket URL.
    pub hub_url: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
    /// Display name; falls back to the user id.
    pub user_name: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the `Hello`/`Welcome` handshake.
    pub hello_timeout: Duration,
    /// Timeout for subscription acks and RPC replies.
    pub rpc_timeout: Duration,

    /// Typing indicator timings.
    pub typing: TypingConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let ws = WsTimeouts::default();
        Self {
            hub_url: None,
            user_id: None,
            user_name: None,
            connect_timeout: ws.connect,
            hello_timeout: ws.hello,
            rpc_timeout: ws.rpc,
            typing: TypingConfig::default(),
            reconnect: ReconnectConfig::default(),
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// if any config file cannot be parsed, or if a duration that drives a
    /// timer is zero.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let typing = TypingConfig {
            throttle: non_zero(
                "typing.throttle_ms",
                file.typing.throttle_ms.map(Duration::from_millis),
                defaults.typing.throttle,
            )?,
            timeout: non_zero(
                "typing.timeout_ms",
                file.typing.timeout_ms.map(Duration::from_millis),
                defaults.typing.timeout,
            )?,
            sweep_interval: non_zero(
                "typing.sweep_interval_ms",
                file.typing.sweep_interval_ms.map(Duration::from_millis),
                defaults.typing.sweep_interval,
            )?,
            stale_grace: file
                .typing
                .stale_grace_ms
                .map_or(defaults.typing.stale_grace, Duration::from_millis),
        };
        let reconnect = ReconnectConfig {
            initial_delay: non_zero(
                "reconnect.initial_delay_ms",
                file.reconnect.initial_delay_ms.map(Duration::from_millis),
                defaults.reconnect.initial_delay,
            )?,
            max_delay: non_zero(
                "reconnect.max_delay_ms",
                file.reconnect.max_delay_ms.map(Duration::from_millis),
                defaults.reconnect.max_delay,
            )?,
            max_attempts: match file.reconnect.max_attempts {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.reconnect.max_attempts,
            },
        };

        Ok(Self {
            hub_url: cli.hub_url.clone().or_else(|| file.hub.url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.hub.user_id.clone()),
            user_name: cli
                .user_name
                .clone()
                .or_else(|| file.hub.user_name.clone()),
            connect_timeout: non_zero(
                "hub.connect_timeout_secs",
                file.hub.connect_timeout_secs.map(Duration::from_secs),
                defaults.connect_timeout,
            )?,
            hello_timeout: non_zero(
                "hub.hello_timeout_secs",
                file.hub.hello_timeout_secs.map(Duration::from_secs),
                defaults.hello_timeout,
            )?,
            rpc_timeout: non_zero(
                "hub.rpc_timeout_secs",
                file.hub.rpc_timeout_secs.map(Duration::from_secs),
                defaults.rpc_timeout,
            )?,
            typing,
            reconnect,
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        })
    }

    /// Timeouts for [`WsRealtime`](crate::realtime::ws::WsRealtime).
    #[must_use]
    pub const fn ws_timeouts(&self) -> WsTimeouts {
        WsTimeouts {
            connect: self.connect_timeout,
            hello: self.hello_timeout,
            rpc: self.rpc_timeout,
        }
    }

    /// The session to connect with, if the hub URL and user id are set.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        let hub_url = self.hub_url.clone()?;
        let user_id = self.user_id.clone().filter(|id| !id.trim().is_empty())?;
        let user_name = self.user_name.clone().unwrap_or_else(|| user_id.clone());
        Some(Session {
            hub_url,
            user_id: UserId::new(user_id),
            user_name,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ClassChat realtime client")]
pub struct CliArgs {
    /// WebSocket URL of the hub.
    #[arg(long, env = "CLASSCHAT_HUB_URL")]
    pub hub_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "CLASSCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// Display name shown to other participants.
    #[arg(long, env = "CLASSCHAT_USER_NAME")]
    pub user_name: Option<String>,

    /// Path to config file (default: `~/.config/classchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CLASSCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/classchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What to do once connected.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List your threads, most recently active first.
    Threads {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Start a new thread.
    New {
        /// Subject line.
        #[arg(long)]
        subject: String,
        /// Other participants (comma separated user ids).
        #[arg(long = "with", value_delimiter = ',', required = true)]
        with: Vec<String>,
    },
    /// Open a thread and chat interactively.
    Chat {
        /// Thread id.
        #[arg(long)]
        thread: ThreadId,
    },
}

/// `value` or `default`, refusing an explicit zero.
fn non_zero(
    key: &'static str,
    value: Option<Duration>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(d) if d.is_zero() => Err(ConfigError::ZeroDuration { key }),
        Some(d) => Ok(d),
        None => Ok(default),
    }
}

/// Reads `explicit_path` (must exist) or the default path (may be missing).
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("classchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
