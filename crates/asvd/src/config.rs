//! Daemon configuration.
//!
//! Resolution order, later layers winning: built-in defaults, then the TOML
//! file (`$XDG_CONFIG_HOME/asv/config.toml` or an explicit path), then
//! `ASV_*` environment variables. Command-line flags are applied on top by
//! the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bus::DEFAULT_WATCH_BUFFER;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Environment variables read by [`Config::apply_env`].
pub const ENV_HOST: &str = "ASV_HOST";
pub const ENV_PORT: &str = "ASV_PORT";
pub const ENV_PROJECTS_DIR: &str = "ASV_PROJECTS_DIR";
pub const ENV_DB_PATH: &str = "ASV_DB_PATH";
pub const ENV_MACHINE: &str = "ASV_MACHINE";
pub const ENV_WRITE_TIMEOUT_MS: &str = "ASV_WRITE_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Resolved daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP server binds to
    pub host: String,
    pub port: u16,
    /// Root holding one directory per project of `*.jsonl` transcripts
    pub projects_dir: PathBuf,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Label stored on every ingested session
    pub machine: String,
    /// Budget for bounded requests
    pub write_timeout_ms: u64,
    /// Fallback tail period when filesystem events are missed
    pub poll_interval_ms: u64,
    /// Events buffered per watch subscriber before the oldest are dropped
    pub watch_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            projects_dir: default_projects_dir(),
            db_path: default_db_path(),
            machine: default_machine(),
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

fn default_db_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("asv")
        .join("sessions.db")
}

fn default_machine() -> String {
    sysinfo::System::host_name().unwrap_or_default()
}

/// `$XDG_CONFIG_HOME/asv/config.toml` (platform equivalent elsewhere).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("asv").join("config.toml"))
}

impl Config {
    /// Loads defaults, the config file and the environment.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file; keys it omits keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Applies `ASV_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Applies `ASV_*` variables resolved through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(host) = get(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            self.port = parse_env(ENV_PORT, &port)?;
        }
        if let Some(dir) = get(ENV_PROJECTS_DIR) {
            self.projects_dir = PathBuf::from(dir);
        }
        if let Some(db) = get(ENV_DB_PATH) {
            self.db_path = PathBuf::from(db);
        }
        if let Some(machine) = get(ENV_MACHINE) {
            self.machine = machine;
        }
        if let Some(ms) = get(ENV_WRITE_TIMEOUT_MS) {
            self.write_timeout_ms = parse_env(ENV_WRITE_TIMEOUT_MS, &ms)?;
        }
        Ok(())
    }

    /// Rejects settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.watch_buffer == 0 {
            return Err(ConfigError::Invalid("watch_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `host:port` for display and binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert!(config.projects_dir.ends_with(".claude/projects"));
        assert!(config.db_path.ends_with("asv/sessions.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 9000\nwrite_timeout_ms = 500\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.write_timeout_ms, 500);
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "prot = 9000\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            (ENV_PORT, "7070"),
            (ENV_MACHINE, "build-box"),
            (ENV_WRITE_TIMEOUT_MS, "250"),
            (ENV_HOST, "  "),
        ]);
        let mut config = Config::default();
        config.apply_env_from(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.port, 7070);
        assert_eq!(config.machine, "build-box");
        assert_eq!(config.write_timeout(), Duration::from_millis(250));
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn test_bad_env_value() {
        let vars = env(&[(ENV_PORT, "eighty")]);
        let mut config = Config::default();
        let err = config.apply_env_from(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("ASV_PORT"));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let config = Config {
            write_timeout_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
