//! Service configuration for coverid-matcher
//!
//! Priority, highest first: command line → `COVERID_*` environment →
//! TOML file → compiled defaults. Engine presets live in the database and
//! are managed by `PresetStore`, not here.

use clap::Parser;
use coverid_common::config::{default_config_path, load_toml_config, resolve_root_folder, TomlConfig};
use coverid_common::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::RetentionPolicy;
use crate::db::DATABASE_FILE_NAME;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5731;
pub const ROOT_FOLDER_ENV: &str = "COVERID_ROOT_FOLDER";

/// Command-line arguments for coverid-matcher
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "coverid-matcher")]
#[command(about = "Comic cover recognition service")]
#[command(version)]
pub struct Cli {
    /// Data folder holding the SQLite database
    #[arg(short, long, env = "COVERID_ROOT_FOLDER")]
    pub root_folder: Option<PathBuf>,

    /// TOML config file (defaults to the platform config directory)
    #[arg(short, long, env = "COVERID_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long, env = "COVERID_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "COVERID_PORT")]
    pub port: Option<u16>,

    /// Default log filter when RUST_LOG is not set
    #[arg(long, env = "COVERID_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Fully resolved service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub root_folder: PathBuf,
    pub bind_address: String,
    pub port: u16,
    pub log_level: String,
    pub cache: RetentionPolicy,
    pub heartbeat: Duration,
    pub stale_check: Duration,
    pub fetch_timeout: Duration,
}

impl ServiceConfig {
    /// Resolve from the command line plus the TOML file it points at
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let toml = match cli.config.clone().or_else(default_config_path) {
            Some(path) => load_toml_config(&path)?,
            None => TomlConfig::default(),
        };
        Ok(Self::from_sources(cli, &toml))
    }

    pub fn from_sources(cli: &Cli, toml: &TomlConfig) -> Self {
        Self {
            root_folder: resolve_root_folder(cli.root_folder.as_deref(), ROOT_FOLDER_ENV, toml),
            bind_address: cli
                .bind_address
                .clone()
                .or_else(|| toml.bind_address.clone())
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            port: cli.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log_level: cli
                .log_level
                .clone()
                .unwrap_or_else(|| toml.logging.level.clone()),
            cache: RetentionPolicy::from(&toml.cache),
            heartbeat: Duration::from_secs(toml.progress.heartbeat_secs.max(1)),
            stale_check: Duration::from_secs(toml.progress.stale_check_secs.max(1)),
            fetch_timeout: Duration::from_secs(toml.candidates.fetch_timeout_secs.max(1)),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_sources(&Cli::default(), &TomlConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let config = ServiceConfig::from_sources(&Cli::default(), &TomlConfig::default());
        assert_eq!(config.listen_address(), "127.0.0.1:5731");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.heartbeat, Duration::from_secs(15));
        assert_eq!(config.stale_check, Duration::from_secs(60));
        assert_eq!(config.fetch_timeout, Duration::from_secs(20));
        assert_eq!(config.cache.max_size_bytes, 512 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn test_cli_overrides_toml() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let toml: TomlConfig = toml::from_str(
            r#"
root_folder = "/srv/toml"
port = 6000
bind_address = "0.0.0.0"

[logging]
level = "warn"

[progress]
heartbeat_secs = 5
"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "coverid-matcher",
            "--port",
            "7000",
            "--root-folder",
            "/srv/cli",
        ])
        .unwrap();

        let config = ServiceConfig::from_sources(&cli, &toml);
        assert_eq!(config.port, 7000);
        assert_eq!(config.root_folder, PathBuf::from("/srv/cli"));
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert_eq!(config.database_path(), PathBuf::from("/srv/cli/coverid.db"));
    }

    #[test]
    #[serial]
    fn test_toml_root_folder_used_without_cli_or_env() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let toml: TomlConfig = toml::from_str(r#"root_folder = "/srv/toml""#).unwrap();
        let config = ServiceConfig::from_sources(&Cli::default(), &toml);
        assert_eq!(config.root_folder, PathBuf::from("/srv/toml"));
    }
}
