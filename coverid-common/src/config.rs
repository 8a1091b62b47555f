//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application name used for config and data directories
pub const APP_DIR_NAME: &str = "coverid";

/// Config file name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "coverid.toml";

/// On-disk TOML configuration
///
/// Every field is optional in the file; missing sections fall back to
/// their `Default` implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Data folder holding the SQLite database
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Address the HTTP server binds to
    #[serde(default)]
    pub bind_address: Option<String>,

    /// HTTP port
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub candidates: CandidateConfig,
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set (e.g. "info", "coverid_matcher=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Feature/result cache retention section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept in the in-memory hot layer
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// Durable entries older than this are evicted
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Upper bound on total durable blob size
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: default_max_memory_entries(),
            max_age_days: default_max_age_days(),
            max_size_mb: default_max_size_mb(),
        }
    }
}

/// Progress streaming section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Keep-alive interval on progress streams
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// How often the stale-session monitor runs
    #[serde(default = "default_stale_check_secs")]
    pub stale_check_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            stale_check_secs: default_stale_check_secs(),
        }
    }
}

/// Candidate image download section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_memory_entries() -> usize {
    2048
}

fn default_max_age_days() -> u32 {
    30
}

fn default_max_size_mb() -> u64 {
    512
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_stale_check_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `root_folder` from the TOML config
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Default location of the TOML config file for this platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load TOML config, returning defaults when the file does not exist
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!("No config file at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Write TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("./coverid_data"))
}
