//! Tracing subscriber setup shared by the CLI and tests.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt};

use crate::config::EnvParser;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
            Self::Compact => "compact",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    pub file: Option<PathBuf>,
    /// Problems found while reading `DSO_LOG_*`, reported once logging is up.
    pub env_errors: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            stderr: false,
            file: None,
            env_errors: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Read `DSO_LOG_LEVEL`, `DSO_LOG_FORMAT` and `DSO_LOG_FILE`.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.log_level("LOG_LEVEL", default_level).value;
        let raw_format = parser.text("LOG_FORMAT", "pretty").value;
        let file = parser.optional_text("LOG_FILE").value.map(PathBuf::from);

        let mut env_errors: Vec<String> = parser
            .take_errors()
            .into_iter()
            .map(|e| e.to_string())
            .collect();
        let format = raw_format.parse().unwrap_or_else(|err: String| {
            env_errors.push(format!("DSO_LOG_FORMAT: {err}"));
            LogFormat::Pretty
        });

        Self {
            level,
            format,
            stderr: false,
            file,
            env_errors,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps background log writers alive. Drop flushes them.
#[derive(Default)]
pub struct LoggingGuards {
    file_guard: Option<WorkerGuard>,
    /// False when a global subscriber was already installed.
    pub installed: bool,
}

impl fmt::Debug for LoggingGuards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingGuards")
            .field("file", &self.file_guard.is_some())
            .field("installed", &self.installed)
            .finish()
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> tfmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let base = tfmt::layer().with_writer(writer).with_ansi(ansi).with_target(true);
    match format {
        LogFormat::Pretty => base.boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().with_current_span(true).boxed(),
    }
}

fn open_appender(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("log file path {} has no file name", path.display()))?;
    let appender = tracing_appender::rolling::never(dir, name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber.
///
/// Calling this again after a subscriber exists is not an error; the
/// returned guards then report `installed == false`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = LoggingGuards::default();

    if config.stderr || config.file.is_none() {
        layers.push(format_layer(config.format, std::io::stderr, config.format != LogFormat::Json));
    }

    if let Some(path) = &config.file {
        let (writer, guard) = open_appender(path)?;
        layers.push(format_layer(config.format, writer, false));
        guards.file_guard = Some(guard);
    }

    guards.installed = tracing_subscriber::registry()
        .with(layers)
        .with(config.filter())
        .try_init()
        .is_ok();

    for problem in &config.env_errors {
        warn!(problem = %problem, "Ignoring invalid logging setting");
    }

    Ok(guards)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear() {
        for var in ["DSO_LOG_LEVEL", "DSO_LOG_FORMAT", "DSO_LOG_FILE"] {
            // SAFETY: env tests are serialized with #[serial]
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_variables() {
        clear();
        // SAFETY: env tests are serialized with #[serial]
        unsafe {
            std::env::set_var("DSO_LOG_LEVEL", "DEBUG");
            std::env::set_var("DSO_LOG_FORMAT", "json");
            std::env::set_var("DSO_LOG_FILE", "/tmp/dso-test.log");
        }
        let config = LogConfig::from_env("info");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file.as_deref(), Some(Path::new("/tmp/dso-test.log")));
        assert!(config.env_errors.is_empty());
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_collects_bad_values() {
        clear();
        // SAFETY: env tests are serialized with #[serial]
        unsafe {
            std::env::set_var("DSO_LOG_LEVEL", "loud");
            std::env::set_var("DSO_LOG_FORMAT", "xml");
        }
        let config = LogConfig::from_env("warn");
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.env_errors.len(), 2);
        clear();
    }

    #[test]
    #[serial]
    fn test_init_twice_is_tolerated() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::default()
            .with_level("debug")
            .with_format(LogFormat::Compact)
            .with_file(tmp.path().join("logs/dso.log"));

        let first = init_logging(&config).unwrap();
        let second = init_logging(&config).unwrap();
        assert!(!second.installed || !first.installed);
        assert!(tmp.path().join("logs").is_dir());
    }
}
