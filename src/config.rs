//! TOML configuration for lisorch.
//!
//! Every section is optional and falls back to compiled-in defaults. The
//! config file is located via the `--config` flag, the `LISORCH_CONFIG`
//! environment variable, or `/etc/lisorch/lisorch.toml`, in that order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for an orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LisorchConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub marker: MarkerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl LisorchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded lisorch configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (the `--config` flag). Errors here are fatal.
    /// 2. The path in the `LISORCH_CONFIG` environment variable.
    /// 3. `/etc/lisorch/lisorch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("LISORCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LISORCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/lisorch/lisorch.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Which transport carries commands to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// OpenSSH client binary.
    Ssh,
    /// `sh -c` on the orchestrating machine; host addresses are ignored.
    Local,
}

/// Remote command channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    /// Path (or bare command name resolved via `$PATH`) to the ssh client.
    pub ssh_binary: String,
    /// Default login user for hosts that don't name one.
    pub user: String,
    pub port: u16,
    /// Default private key for hosts that don't name one.
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
    /// Retries after a connection failure. Nonzero exit codes are never retried.
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Multiplier applied to the retry delay after each attempt.
    pub retry_backoff: f64,
    /// Overall deadline for a single blocking command.
    pub command_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Ssh,
            ssh_binary: "ssh".to_string(),
            user: "lisatest".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            connect_retries: 3,
            retry_delay_ms: 1000,
            retry_backoff: 3.0,
            command_timeout_secs: 600,
        }
    }
}

impl ExecutorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Defaults for readiness polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Interval multiplier applied after each unsuccessful poll. 1.0 keeps
    /// the interval fixed.
    pub backoff: f64,
    pub max_interval_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 600,
            backoff: 1.0,
            max_interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Marker
// ---------------------------------------------------------------------------

/// Location of the per-host state marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Relative paths resolve against the login user's home directory.
    pub path: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            path: "state.txt".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/lisorch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = LisorchConfig::default();

        assert_eq!(cfg.executor.kind, ExecutorKind::Ssh);
        assert_eq!(cfg.executor.ssh_binary, "ssh");
        assert_eq!(cfg.executor.port, 22);
        assert!(cfg.executor.identity_file.is_none());
        assert_eq!(cfg.executor.connect_retries, 3);
        assert_eq!(cfg.executor.command_timeout(), Duration::from_secs(600));

        assert_eq!(cfg.poll.interval_secs, 5);
        assert_eq!(cfg.poll.timeout_secs, 600);
        assert_eq!(cfg.poll.backoff, 1.0);

        assert_eq!(cfg.marker.path, "state.txt");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/lisorch.db"));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        assert_eq!(cfg.api.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[executor]
kind = "local"
user = "azureuser"
port = 2222
identity_file = "/home/azureuser/.ssh/id_ed25519"
connect_retries = 0

[poll]
interval_secs = 2
timeout_secs = 120
backoff = 1.5
max_interval_secs = 10

[marker]
path = "/tmp/state.txt"

[storage]
db_path = "/var/lib/lisorch/runs.db"

[logging]
level = "debug"
format = "json"

[api]
bind = "0.0.0.0:9000"
"#;

        let cfg: LisorchConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.executor.kind, ExecutorKind::Local);
        assert_eq!(cfg.executor.user, "azureuser");
        assert_eq!(cfg.executor.port, 2222);
        assert_eq!(
            cfg.executor.identity_file.as_deref(),
            Some("/home/azureuser/.ssh/id_ed25519")
        );
        assert_eq!(cfg.executor.connect_retries, 0);
        assert_eq!(cfg.poll.interval_secs, 2);
        assert_eq!(cfg.poll.backoff, 1.5);
        assert_eq!(cfg.marker.path, "/tmp/state.txt");
        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/lisorch/runs.db"));
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.api.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: LisorchConfig = toml::from_str("[poll]\ntimeout_secs = 60\n").unwrap();

        assert_eq!(cfg.poll.timeout_secs, 60);
        assert_eq!(cfg.poll.interval_secs, 5);
        assert_eq!(cfg.executor.ssh_binary, "ssh");
        assert_eq!(cfg.marker.path, "state.txt");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lisorch.toml");
        std::fs::write(&path, "[marker]\npath = \"/root/state.txt\"\n").unwrap();

        let cfg = LisorchConfig::load(&path).unwrap();
        assert_eq!(cfg.marker.path, "/root/state.txt");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = LisorchConfig::resolve(Some(Path::new("/nonexistent/lisorch.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = LisorchConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: LisorchConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.executor.command_timeout_secs, back.executor.command_timeout_secs);
        assert_eq!(cfg.poll.max_interval_secs, back.poll.max_interval_secs);
    }
}
