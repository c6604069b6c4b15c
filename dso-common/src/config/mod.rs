//! Configuration for the orchestrator.
//!
//! Settings come from three layers, later layers winning:
//! built-in defaults, an optional TOML file, and `DSO_` environment
//! variables. Every effective value is tagged with its origin so
//! `dso config show` can explain where it came from.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::history::RunHistory;
use crate::orchestrator::OrchestratorOptions;
use crate::retry::RetryPolicy;
use crate::session::SessionOptions;
use crate::snapshot::SnapshotStore;
use crate::types::DeviceId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Environment(Vec<EnvError>),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dso")
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dso")
        .join("config.toml")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub command_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_delay_ms: 1500,
            command_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub root: PathBuf,
    pub keep: u32,
    pub auto_prune: bool,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            root: data_dir().join("snapshots"),
            keep: 5,
            auto_prune: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub file_mode: u32,
    pub parallel: bool,
    pub restart_services: Vec<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let defaults = OrchestratorOptions::default();
        Self {
            file_mode: defaults.file_mode,
            parallel: defaults.parallel,
            restart_services: defaults.restart_services,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub path: PathBuf,
    pub enabled: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            path: data_dir().join("history.jsonl"),
            enabled: true,
        }
    }
}

/// A device reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_device_user")]
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Optional short name usable on the command line.
    #[serde(default)]
    pub alias: Option<String>,
}

fn default_device_user() -> String {
    "root".to_string()
}

impl DeviceConfig {
    /// `user@host[:port]`.
    pub fn device_id(&self) -> DeviceId {
        match self.port {
            Some(port) => DeviceId::new(format!("{}@{}:{port}", self.user, self.host)),
            None => DeviceId::new(format!("{}@{}", self.user, self.host)),
        }
    }

    pub fn matches(&self, query: &str) -> bool {
        self.alias.as_deref() == Some(query)
            || self.device_id().as_str() == query
            || self.host == query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsoConfig {
    pub session: SessionSettings,
    pub snapshot: SnapshotSettings,
    pub transfer: TransferSettings,
    pub history: HistorySettings,
    pub devices: Vec<DeviceConfig>,
}

impl DsoConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            retry: RetryPolicy::fixed(
                self.session.connect_attempts,
                Duration::from_millis(self.session.retry_delay_ms),
            ),
            command_timeout: Duration::from_secs(self.session.command_timeout_secs),
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            file_mode: self.transfer.file_mode,
            parallel: self.transfer.parallel,
            restart_services: self.transfer.restart_services.clone(),
            keep_snapshots: self.snapshot.keep as usize,
            auto_prune: self.snapshot.auto_prune,
        }
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.snapshot.root)
    }

    pub fn run_history(&self) -> Option<RunHistory> {
        self.history
            .enabled
            .then(|| RunHistory::new(&self.history.path))
    }

    pub fn find_device(&self, query: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.matches(query))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "session.connect_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.session.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "session.command_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.snapshot.keep == 0 {
            return Err(ConfigError::Invalid {
                key: "snapshot.keep",
                reason: "must keep at least one snapshot".to_string(),
            });
        }
        if self.transfer.file_mode > 0o7777 {
            return Err(ConfigError::Invalid {
                key: "transfer.file_mode",
                reason: format!("{:o} is not a valid mode", self.transfer.file_mode),
            });
        }
        Ok(())
    }
}

/// Effective configuration plus the origin of each setting.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: DsoConfig,
    /// File that was read, if any.
    pub file: Option<PathBuf>,
    pub sources: BTreeMap<&'static str, Sourced<()>>,
}

impl LoadedConfig {
    pub fn value_sources(&self) -> Vec<ConfigValueSource> {
        self.sources
            .iter()
            .map(|(key, sourced)| ConfigValueSource {
                key: (*key).to_string(),
                source: sourced.source.clone(),
                env_var: sourced.env_var.clone(),
            })
            .collect()
    }
}

const FILE_KEYS: &[(&str, &str, &str)] = &[
    ("session.connect_attempts", "session", "connect_attempts"),
    ("session.retry_delay_ms", "session", "retry_delay_ms"),
    ("session.command_timeout_secs", "session", "command_timeout_secs"),
    ("snapshot.root", "snapshot", "root"),
    ("snapshot.keep", "snapshot", "keep"),
    ("snapshot.auto_prune", "snapshot", "auto_prune"),
    ("transfer.file_mode", "transfer", "file_mode"),
    ("transfer.parallel", "transfer", "parallel"),
    ("transfer.restart_services", "transfer", "restart_services"),
    ("history.path", "history", "path"),
    ("history.enabled", "history", "enabled"),
];

/// Load configuration.
///
/// An explicit `path` must exist. Without one, the default location is
/// used when present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let (file, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    let mut sources: BTreeMap<&'static str, Sourced<()>> = FILE_KEYS
        .iter()
        .map(|(key, _, _)| (*key, Sourced::default_value(())))
        .collect();

    let (mut config, file_used) = if file.exists() {
        let raw = fs::read_to_string(&file).map_err(|source| ConfigError::Read {
            path: file.clone(),
            source,
        })?;
        let config: DsoConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: file.clone(),
            source,
        })?;
        if let Ok(table) = raw.parse::<toml::Table>() {
            for (key, section, field) in FILE_KEYS {
                let present = table
                    .get(*section)
                    .and_then(|s| s.as_table())
                    .is_some_and(|s| s.contains_key(*field));
                if present {
                    sources.insert(
                        *key,
                        Sourced {
                            value: (),
                            source: ConfigSource::File(file.clone()),
                            env_var: None,
                        },
                    );
                }
            }
        }
        debug!(path = %file.display(), "Loaded config file");
        (config, Some(file))
    } else if explicit {
        return Err(ConfigError::NotFound(file));
    } else {
        (DsoConfig::default(), None)
    };

    config.snapshot.root = env::expand_tilde(&config.snapshot.root.to_string_lossy());
    config.history.path = env::expand_tilde(&config.history.path.to_string_lossy());

    apply_env_overrides(&mut config, &mut sources)?;
    config.validate()?;

    Ok(LoadedConfig {
        config,
        file: file_used,
        sources,
    })
}

fn apply_env_overrides(
    config: &mut DsoConfig,
    sources: &mut BTreeMap<&'static str, Sourced<()>>,
) -> Result<(), ConfigError> {
    let mut parser = EnvParser::new();

    fn take<T>(
        sources: &mut BTreeMap<&'static str, Sourced<()>>,
        key: &'static str,
        sourced: Sourced<T>,
        slot: &mut T,
    ) {
        if sourced.is_from_env() {
            sources.insert(
                key,
                Sourced {
                    value: (),
                    source: ConfigSource::Environment,
                    env_var: sourced.env_var,
                },
            );
            *slot = sourced.value;
        }
    }

    let v = parser.bounded("CONNECT_ATTEMPTS", config.session.connect_attempts, 1..=20);
    take(sources, "session.connect_attempts", v, &mut config.session.connect_attempts);
    let v = parser.bounded("RETRY_DELAY_MS", config.session.retry_delay_ms, 0..=60_000);
    take(sources, "session.retry_delay_ms", v, &mut config.session.retry_delay_ms);
    let v = parser.bounded(
        "COMMAND_TIMEOUT_SECS",
        config.session.command_timeout_secs,
        1..=3600,
    );
    take(sources, "session.command_timeout_secs", v, &mut config.session.command_timeout_secs);

    let v = parser.local_path("SNAPSHOT_ROOT", config.snapshot.root.clone());
    take(sources, "snapshot.root", v, &mut config.snapshot.root);
    let v = parser.bounded("SNAPSHOT_KEEP", config.snapshot.keep, 1..=1000);
    take(sources, "snapshot.keep", v, &mut config.snapshot.keep);
    let v = parser.flag("AUTO_PRUNE", config.snapshot.auto_prune);
    take(sources, "snapshot.auto_prune", v, &mut config.snapshot.auto_prune);

    let v = parser.file_mode("FILE_MODE", config.transfer.file_mode);
    take(sources, "transfer.file_mode", v, &mut config.transfer.file_mode);
    let v = parser.flag("PARALLEL", config.transfer.parallel);
    take(sources, "transfer.parallel", v, &mut config.transfer.parallel);
    let v = parser.service_names("RESTART_SERVICES", config.transfer.restart_services.clone());
    take(sources, "transfer.restart_services", v, &mut config.transfer.restart_services);

    let v = parser.local_path("HISTORY_PATH", config.history.path.clone());
    take(sources, "history.path", v, &mut config.history.path);
    let v = parser.flag("HISTORY_ENABLED", config.history.enabled);
    take(sources, "history.enabled", v, &mut config.history.enabled);

    if parser.has_errors() {
        return Err(ConfigError::Environment(parser.take_errors()));
    }
    Ok(())
}
