//! Configuration for the `ClassChat` hub.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/classchat-hub/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading hub configuration.
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

    /// A capacity limit was set to zero, which would make the hub unusable.
    #[error("{key} must be at least 1")]
    ZeroLimit {
        /// Setting name, e.g. `max_topics_per_client`.
        key: &'static str,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HubConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the hub config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
    max_messages_per_thread: Option<usize>,
    max_topics_per_client: Option<usize>,
}

/// CLI arguments for the hub.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ClassChat realtime hub")]
pub struct HubCliArgs {
    /// Address to bind the hub to.
    #[arg(short, long, env = "HUB_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/classchat-hub/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum broadcast payload size in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Messages retained per thread before the oldest are evicted.
    #[arg(long)]
    pub max_messages_per_thread: Option<usize>,

    /// Maximum number of topics a single client may subscribe to.
    #[arg(long)]
    pub max_topics_per_client: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HUB_LOG")]
    pub log_level: String,
}

/// Fully resolved hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Maximum allowed broadcast payload size in bytes.
    pub max_payload_size: usize,
    /// Messages retained per thread.
    pub max_messages_per_thread: usize,
    /// Topic subscriptions allowed per client.
    pub max_topics_per_client: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_payload_size: 64 * 1024,
            max_messages_per_thread: 1000,
            max_topics_per_client: 100,
            log_level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Without `--config` the default path is tried and a missing file is
    /// treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a limit resolves to zero.
    pub fn load(cli: &HubCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &HubCliArgs, file: &HubConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let server = &file.server;

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_payload_size: limit(
                "max_payload_size",
                cli.max_payload_size.or(server.max_payload_size),
                defaults.max_payload_size,
            )?,
            max_messages_per_thread: limit(
                "max_messages_per_thread",
                cli.max_messages_per_thread.or(server.max_messages_per_thread),
                defaults.max_messages_per_thread,
            )?,
            max_topics_per_client: limit(
                "max_topics_per_client",
                cli.max_topics_per_client.or(server.max_topics_per_client),
                defaults.max_topics_per_client,
            )?,
            log_level: cli.log_level.clone(),
        })
    }
}

fn limit(key: &'static str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::ZeroLimit { key }),
        Some(n) => Ok(n),
        None => Ok(default),
    }
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<HubConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(HubConfigFile::default());
    };
    let path = config_dir.join("classchat-hub").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HubConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
