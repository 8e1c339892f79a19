//! Layered configuration
//!
//! Built-in defaults, then an optional TOML file, then `RAYLINK_*`
//! environment variables (`__` separates nested keys).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::actors::ConnectRequest;
use crate::remote::{LocalTarget, SessionPaths, SshTarget, Transport};
use crate::workers::ExecuteOptions;

const BUILTIN_CONFIG_TOML: &str = include_str!("../config/raylink.example.toml");

pub const DEFAULT_CONFIG_PATH: &str = "raylink.toml";
pub const CONFIG_PATH_ENV: &str = "RAYLINK_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub control_dir: Option<PathBuf>,
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    pub remote_root: String,
    /// Empty means `$HOME/raylink`.
    #[serde(default)]
    pub local_root: String,
    pub project: String,
    #[serde(default)]
    pub upload_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsConfig {
    pub prefix: String,
    pub prepend_prefix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub progress_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub connection_grace_polls: u32,
    pub cancel_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaylinkConfig {
    pub connection: ConnectionConfig,
    pub paths: PathsConfig,
    pub commands: CommandsConfig,
    pub orchestrator: OrchestratorConfig,
}

impl RaylinkConfig {
    /// Defaults, `RAYLINK_CONFIG` (or `raylink.toml`) if present, then environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let path_str = path.to_string_lossy();
        let loaded = config::Config::builder()
            .add_source(File::from_str(BUILTIN_CONFIG_TOML, FileFormat::Toml))
            .add_source(File::new(path_str.as_ref(), FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("RAYLINK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(loaded)
    }

    /// Defaults overlaid with a TOML document; no file or environment lookup.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Ok(config::Config::builder()
            .add_source(File::from_str(BUILTIN_CONFIG_TOML, FileFormat::Toml))
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?)
    }

    pub fn transport(&self) -> Transport {
        let connection = &self.connection;
        match connection.transport {
            TransportKind::Local => Transport::Local(LocalTarget {
                shell: connection.shell.clone(),
            }),
            TransportKind::Ssh => {
                let mut target = SshTarget::new(connection.host.clone(), connection.port);
                target.user = connection.user.clone().filter(|u| !u.is_empty());
                target.identity_file = connection.identity_file.clone();
                if let Some(dir) = &connection.control_dir {
                    target.control_dir = dir.clone();
                }
                Transport::Ssh(target)
            }
        }
    }

    pub fn session_paths(&self) -> SessionPaths {
        let paths = &self.paths;
        let base = if paths.local_root.trim().is_empty() {
            let default = SessionPaths::default();
            SessionPaths::new(&paths.remote_root, default.local_root(), &paths.project)
        } else {
            SessionPaths::new(&paths.remote_root, &paths.local_root, &paths.project)
        };
        base.with_upload_root(paths.upload_root.as_deref())
    }

    pub fn connect_request(&self) -> ConnectRequest {
        let mut request = ConnectRequest::new(self.transport(), self.session_paths());
        request.command_prefix = self.commands.prefix.clone();
        request.timeout = Duration::from_secs(self.connection.connect_timeout_secs.max(1));
        request.cancel_grace = Duration::from_millis(self.orchestrator.cancel_grace_ms);
        request
    }

    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            prepend_prefix: self.commands.prepend_prefix,
            poll_interval: Duration::from_millis(self.orchestrator.poll_interval_ms.max(1)),
            connection_grace_polls: self.orchestrator.connection_grace_polls,
            ..ExecuteOptions::default()
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.orchestrator.progress_interval_ms)
    }
}

/// Load the first `.env` found in the current directory or its ancestors.
pub fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => tracing::info!(path = %candidate.display(), "Loaded environment from .env"),
                Err(e) => tracing::warn!(
                    path = %candidate.display(),
                    error = %e,
                    "Failed to load .env file"
                ),
            }
            return;
        }
        if !current.pop() {
            break;
        }
    }

    tracing::debug!(cwd = %cwd.display(), "No .env file found; using process environment only");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let config = RaylinkConfig::from_toml_str("").expect("defaults parse");
        assert_eq!(config.connection.transport, TransportKind::Ssh);
        assert_eq!(config.connection.port, 22);
        assert_eq!(config.connection.connect_timeout_secs, 10);
        assert_eq!(config.paths.remote_root, "~/raylink");
        assert_eq!(config.paths.project, "UnnamedProject");
        assert!(config.commands.prepend_prefix);
        assert!(config.commands.prefix.contains("RAYPATH"));
        assert_eq!(config.orchestrator.progress_interval_ms, 333);
        assert_eq!(config.orchestrator.poll_interval_ms, 100);
        assert_eq!(config.orchestrator.connection_grace_polls, 5);
        assert_eq!(config.orchestrator.cancel_grace_ms, 2000);
    }

    #[test]
    fn test_overrides_merge_over_defaults() {
        let config = RaylinkConfig::from_toml_str(
            r#"
            [connection]
            transport = "local"
            host = "render01"

            [paths]
            project = "Atrium"
            upload_root = "/scratch/up/"
            "#,
        )
        .expect("overrides parse");
        assert_eq!(config.connection.transport, TransportKind::Local);
        assert_eq!(config.connection.port, 22);

        let request = config.connect_request();
        assert!(!request.transport.is_ssh());
        assert_eq!(request.timeout, Duration::from_secs(10));
        assert_eq!(request.cancel_grace, Duration::from_millis(2000));
        assert_eq!(request.paths.remote_home(), "~/raylink/Atrium");
        assert_eq!(request.paths.upload_home(), "/scratch/up");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            RaylinkConfig::load_from(&dir.path().join("absent.toml")).expect("load without file");
        assert_eq!(config.paths.project, "UnnamedProject");
    }

    #[test]
    fn test_file_layer_is_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raylink.toml");
        std::fs::write(&path, "[orchestrator]\npoll_interval_ms = 250\n").expect("write");
        let config = RaylinkConfig::load_from(&path).expect("load file");
        assert_eq!(config.execute_options().poll_interval, Duration::from_millis(250));
    }
}
