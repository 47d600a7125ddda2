//! Xare configuration file handling
//!
//! Provides default configuration generation and loading for the bot.
//! Configuration files are TOML and live next to the session table.
//!
//! Command-line flags always win over values from this file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xare::xmpp::Jid;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// File name of the session table
pub const STORE_FILE_NAME: &str = "omemo-xare.json";

/// Xare configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XareConfig {
    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub backlog: BacklogConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Own account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    pub jid: Option<Jid>,

    /// Account password (optional, prompted for if not set anywhere)
    pub password: Option<String>,
}

/// The one peer this bot talks to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConfig {
    pub jid: Option<Jid>,
}

/// Session table location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

/// Offline backlog retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// How far back to look, e.g. "6h" or "2days"
    #[serde(default = "default_lookback")]
    pub lookback: String,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Where attachments from the backlog are saved
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

/// File upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_timeout")]
    pub timeout: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_lookback() -> String {
    "6h".to_string()
}

fn default_page_size() -> usize {
    10
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_upload_timeout() -> String {
    "10s".to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            page_size: default_page_size(),
            download_dir: default_download_dir(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout: default_upload_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl XareConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: XareConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        Ok(config)
    }

    /// Backlog lookback window
    pub fn lookback(&self) -> Result<Duration, Box<dyn std::error::Error>> {
        humantime::parse_duration(&self.backlog.lookback).map_err(|e| {
            format!("Invalid [backlog] lookback '{}': {}", self.backlog.lookback, e).into()
        })
    }

    /// Upload timeout
    pub fn upload_timeout(&self) -> Result<Duration, Box<dyn std::error::Error>> {
        let timeout = humantime::parse_duration(&self.upload.timeout).map_err(|e| {
            format!("Invalid [upload] timeout '{}': {}", self.upload.timeout, e)
        })?;
        if timeout.is_zero() {
            return Err("[upload] timeout must be greater than zero".into());
        }
        Ok(timeout)
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(store_path: &Path) -> String {
        format!(
            r#"# Xare Bot Configuration
#
# Flags given on the command line override everything in this file.

[account]
# Own account, e.g. "bot@example.org/xare"
# jid = "..."

# Account password. Leave unset to be prompted, or use XARE_PASSWORD.
# password = "..."

[peer]
# The one contact whose backlog is printed and who receives messages
# jid = "..."

[store]
# Session and trust table (JSON, rewritten atomically on every change)
path = "{store_path}"

[backlog]
# How far back to fetch the offline backlog
lookback = "6h"

# Archive results per page
page_size = 10

# Attachments from the backlog are saved here
download_dir = "/tmp"

[upload]
# Upper bound for uploading a file
timeout = "10s"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"
"#,
            store_path = store_path.display()
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(
        config_path: &Path,
        store_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let contents = Self::generate_default_toml(store_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }

    /// Load `path`, writing the commented default there first if it is missing.
    ///
    /// Returns whether the file was created.
    pub fn load_or_create(
        path: &Path,
        store_path: &Path,
    ) -> Result<(Self, bool), Box<dyn std::error::Error>> {
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }
        Self::create_default(path, store_path)?;
        Ok((Self::load(path)?, true))
    }
}

/// Get the default config file path based on the store path
///
/// The config file is stored next to the session table:
/// - Store: ~/.local/share/xare/omemo-xare.json
/// - Config: ~/.local/share/xare/config.toml
pub fn default_config_path(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or(store_path)
        .join("config.toml")
}

/// Get the default store path
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("xare")
        .join(STORE_FILE_NAME)
}

/// Resolve the store and config paths from the flags.
///
/// Precedence for the store: `--store-path`, then `[store] path` from the
/// config, then the default. The config defaults to the file next to the
/// store given on the command line (or the default store).
pub fn resolve_paths(
    config_flag: Option<String>,
    store_flag: Option<String>,
) -> (PathBuf, Option<PathBuf>) {
    let store_flag = store_flag.map(PathBuf::from);
    let config_path = config_flag.map(PathBuf::from).unwrap_or_else(|| {
        let store = store_flag.clone().unwrap_or_else(default_store_path);
        default_config_path(&store)
    });
    (config_path, store_flag)
}

/// Store path after applying the config file
pub fn effective_store_path(store_flag: Option<PathBuf>, config: &XareConfig) -> PathBuf {
    store_flag
        .or_else(|| config.store.path.clone())
        .unwrap_or_else(default_store_path)
}
