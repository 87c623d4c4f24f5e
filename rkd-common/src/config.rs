//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a small TOML file per module
//! (`~/.config/rookdash/<module>.toml`). Every field has a compiled default,
//! so a missing or unreadable file only produces a warning.
//!
//! Root folder priority:
//! 1. Command-line argument (highest priority)
//! 2. `RKD_ROOT_FOLDER` environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "RKD_ROOT_FOLDER";

/// Directory name used under the platform config/data directories
const APP_DIR: &str = "rookdash";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding durable engine state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Remote stats/preferences/telemetry server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the server, without trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for request/response calls (the stats stream is exempt)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quiet interval before a remote existence query
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Minimum normalized length before a lookup is attempted
    #[serde(default = "default_min_identifier_len")]
    pub min_identifier_len: usize,

    /// Heartbeat interval
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Maximum number of remembered recent identities
    #[serde(default = "default_recent_identities_limit")]
    pub recent_identities_limit: usize,

    /// Variant used when no preference has been stored
    #[serde(default = "default_variant")]
    pub default_variant: String,

    /// Page name reported with heartbeats
    #[serde(default = "default_page")]
    pub page: String,

    /// Device class reported with heartbeats (desktop, tablet, mobile)
    #[serde(default = "default_device_class")]
    pub device_class: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            min_identifier_len: default_min_identifier_len(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            recent_identities_limit: default_recent_identities_limit(),
            default_variant: default_variant(),
            page: default_page(),
            device_class: default_device_class(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    400
}

fn default_min_identifier_len() -> usize {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_recent_identities_limit() -> usize {
    5
}

fn default_variant() -> String {
    "rapid".to_string()
}

fn default_page() -> String {
    "chess".to_string()
}

fn default_device_class() -> String {
    "desktop".to_string()
}

/// Compiled defaults for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/rookdash
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/var/lib/rookdash"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/rookdash
        dirs::data_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/rookdash"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\rookdash
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\rookdash"))
    } else {
        PathBuf::from("./rookdash_data")
    }
}

/// Default TOML path for a module (`~/.config/rookdash/<module>.toml`)
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(format!("{}.toml", module_name)))
}

/// Load TOML configuration from an explicit path
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load TOML configuration, falling back to defaults
///
/// A missing file is normal (debug log); an unreadable or malformed file
/// produces a warning. Neither is fatal.
pub fn load_toml_config_or_default(path: Option<&Path>) -> TomlConfig {
    let Some(path) = path else {
        debug!("No config path available, using compiled defaults");
        return TomlConfig::default();
    };

    if !path.exists() {
        debug!(path = %path.display(), "Config file not found, using compiled defaults");
        return TomlConfig::default();
    }

    match load_toml_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config file unusable, using compiled defaults");
            TomlConfig::default()
        }
    }
}

/// Write TOML configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolves the root folder following the documented priority order
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_config: Option<TomlConfig>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_config: None,
        }
    }

    /// Highest-priority override from the command line
    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    /// Use an already-loaded TOML config instead of reading the default path
    pub fn with_toml_config(mut self, config: TomlConfig) -> Self {
        self.toml_config = Some(config);
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        // Priority 3: TOML config file
        let toml_root = match &self.toml_config {
            Some(config) => config.root_folder.clone(),
            None => {
                let path = default_config_path(&self.module_name);
                load_toml_config_or_default(path.as_deref()).root_folder
            }
        };
        if let Some(root) = toml_root {
            return root;
        }

        // Priority 4: OS-dependent compiled default
        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Prepares the root folder for the durable preference store
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Directory holding persisted preference records
    pub fn state_dir(&self) -> PathBuf {
        self.root_folder.join("state")
    }

    /// Create the root and state directories if missing (idempotent)
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(self.state_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [server]
            base_url = "https://stats.example.com"

            [engine]
            debounce_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.server.base_url, "https://stats.example.com");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.engine.debounce_ms, 250);
        assert_eq!(config.engine.min_identifier_len, 3);
        assert_eq!(config.engine.heartbeat_interval_secs, 15);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config, TomlConfig::default());
    }
}
