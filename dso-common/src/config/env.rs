//! `DSO_*` environment overrides.
//!
//! Each reader returns a [`Sourced`] value and records a problem instead of
//! failing, so `load_config` can report every bad variable in one go.

use super::source::Sourced;
use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const PREFIX: &str = "DSO_";
const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// A `DSO_*` variable that could not be applied.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}={value:?} is not {expected}")]
    Malformed {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("{var}={value} is outside {range}")]
    OutOfRange {
        var: String,
        value: String,
        range: String,
    },

    #[error("{var}={value:?} is not an octal file mode such as 0755")]
    BadMode { var: String, value: String },

    #[error("{var} lists {name:?}, which is not a bare process name")]
    BadServiceName { var: String, name: String },
}

/// Reads overrides for one config load.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name and trimmed value. Blank counts as unset.
    fn read(key: &str) -> Option<(String, String)> {
        let var = format!("{PREFIX}{key}");
        let value = env::var(&var).ok()?;
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some((var, value.to_string()))
        }
    }

    /// `1/true/yes/on` or `0/false/no/off`.
    pub fn flag(&mut self, key: &str, default: bool) -> Sourced<bool> {
        let Some((var, value)) = Self::read(key) else {
            return Sourced::default_value(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Sourced::from_env(true, var),
            "0" | "false" | "no" | "off" => Sourced::from_env(false, var),
            _ => {
                self.errors.push(EnvError::Malformed {
                    var,
                    value,
                    expected: "a boolean (true/false, yes/no, on/off, 1/0)",
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Attempt counts, delays and timeouts: a whole number inside `range`.
    pub fn bounded<N>(&mut self, key: &str, default: N, range: RangeInclusive<N>) -> Sourced<N>
    where
        N: FromStr + PartialOrd + Display + Copy,
    {
        let Some((var, value)) = Self::read(key) else {
            return Sourced::default_value(default);
        };
        match value.parse::<N>() {
            Ok(n) if range.contains(&n) => Sourced::from_env(n, var),
            Ok(_) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value,
                    range: format!("{}..={}", range.start(), range.end()),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::Malformed {
                    var,
                    value,
                    expected: "a whole number",
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Permission bits for transferred artifacts, written in octal.
    pub fn file_mode(&mut self, key: &str, default: u32) -> Sourced<u32> {
        let Some((var, value)) = Self::read(key) else {
            return Sourced::default_value(default);
        };
        match parse_mode(&value) {
            Some(mode) => Sourced::from_env(mode, var),
            None => {
                self.errors.push(EnvError::BadMode { var, value });
                Sourced::default_value(default)
            }
        }
    }

    /// Local directory or file, with a leading `~` expanded.
    pub fn local_path(&mut self, key: &str, default: PathBuf) -> Sourced<PathBuf> {
        match Self::read(key) {
            Some((var, value)) => Sourced::from_env(expand_tilde(&value), var),
            None => Sourced::default_value(default),
        }
    }

    /// Comma separated process names to restart after a transfer.
    /// An empty list after trimming is allowed and disables restarts.
    pub fn service_names(&mut self, key: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        let Some((var, value)) = Self::read(key) else {
            return Sourced::default_value(default);
        };
        let names: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if let Some(bad) = names
            .iter()
            .find(|n| n.contains('/') || n.chars().any(char::is_whitespace))
        {
            self.errors.push(EnvError::BadServiceName {
                var,
                name: bad.clone(),
            });
            return Sourced::default_value(default);
        }
        Sourced::from_env(names, var)
    }

    pub fn log_level(&mut self, key: &str, default: &str) -> Sourced<String> {
        let Some((var, value)) = Self::read(key) else {
            return Sourced::default_value(default.to_string());
        };
        let level = value.to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            Sourced::from_env(level, var)
        } else {
            self.errors.push(EnvError::Malformed {
                var,
                value,
                expected: "one of trace, debug, info, warn, error, off",
            });
            Sourced::default_value(default.to_string())
        }
    }

    /// Free-form text; the caller validates it.
    pub fn text(&mut self, key: &str, default: &str) -> Sourced<String> {
        match Self::read(key) {
            Some((var, value)) => Sourced::from_env(value, var),
            None => Sourced::default_value(default.to_string()),
        }
    }

    pub fn optional_text(&mut self, key: &str) -> Sourced<Option<String>> {
        match Self::read(key) {
            Some((var, value)) => Sourced::from_env(Some(value), var),
            None => Sourced::default_value(None),
        }
    }
}

/// `755`, `0755` and `0o755` all parse; anything above `0o7777` does not.
fn parse_mode(raw: &str) -> Option<u32> {
    let digits = raw.strip_prefix("0o").unwrap_or(raw);
    let mode = u32::from_str_radix(digits, 8).ok()?;
    (mode <= 0o7777).then_some(mode)
}

/// Expand a leading `~` against `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use serial_test::serial;

    fn set(key: &str, value: &str) {
        // SAFETY: env tests are serialized with #[serial]
        unsafe { env::set_var(format!("DSO_{key}"), value) };
    }

    fn unset(key: &str) {
        // SAFETY: env tests are serialized with #[serial]
        unsafe { env::remove_var(format!("DSO_{key}")) };
    }

    #[test]
    #[serial]
    fn test_unset_keeps_default() {
        unset("CONNECT_ATTEMPTS");
        let mut parser = EnvParser::new();
        let v = parser.bounded("CONNECT_ATTEMPTS", 3u32, 1..=20);
        assert_eq!(v.value, 3);
        assert_eq!(v.source, ConfigSource::Default);
        assert!(v.env_var.is_none());
        assert!(!parser.has_errors());
    }

    #[test]
    #[serial]
    fn test_blank_value_is_unset() {
        set("SNAPSHOT_KEEP", "   ");
        let mut parser = EnvParser::new();
        let v = parser.bounded("SNAPSHOT_KEEP", 5u32, 1..=1000);
        assert_eq!(v.value, 5);
        assert!(!v.is_from_env());
        assert!(!parser.has_errors());
        unset("SNAPSHOT_KEEP");
    }

    #[test]
    #[serial]
    fn test_connect_attempts_outside_range() {
        set("CONNECT_ATTEMPTS", "50");
        let mut parser = EnvParser::new();
        let v = parser.bounded("CONNECT_ATTEMPTS", 3u32, 1..=20);
        assert_eq!(v.value, 3);
        let errors = parser.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "DSO_CONNECT_ATTEMPTS=50 is outside 1..=20"
        );
        assert!(!parser.has_errors());
        unset("CONNECT_ATTEMPTS");
    }

    #[test]
    #[serial]
    fn test_timeout_must_be_whole_seconds() {
        set("COMMAND_TIMEOUT_SECS", "1.5");
        let mut parser = EnvParser::new();
        let v = parser.bounded("COMMAND_TIMEOUT_SECS", 60u64, 1..=3600);
        assert_eq!(v.value, 60);
        let errors = parser.take_errors();
        assert!(matches!(
            &errors[0],
            EnvError::Malformed { expected: "a whole number", .. }
        ));

        set("COMMAND_TIMEOUT_SECS", "900");
        let v = parser.bounded("COMMAND_TIMEOUT_SECS", 60u64, 1..=3600);
        assert_eq!(v.value, 900);
        assert_eq!(v.env_var.as_deref(), Some("DSO_COMMAND_TIMEOUT_SECS"));
        unset("COMMAND_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_retry_delay_allows_zero() {
        set("RETRY_DELAY_MS", "0");
        let mut parser = EnvParser::new();
        let v = parser.bounded("RETRY_DELAY_MS", 500u64, 0..=60_000);
        assert_eq!(v.value, 0);
        assert!(v.is_from_env());
        unset("RETRY_DELAY_MS");
    }

    #[test]
    fn test_parse_mode_forms() {
        assert_eq!(parse_mode("755"), Some(0o755));
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("0o4755"), Some(0o4755));
        assert_eq!(parse_mode("0o17777"), None);
        assert_eq!(parse_mode("rwxr-xr-x"), None);
        assert_eq!(parse_mode("0x1ed"), None);
        assert_eq!(parse_mode("789"), None);
    }

    #[test]
    #[serial]
    fn test_bad_file_mode_reported() {
        set("FILE_MODE", "rwxr-xr-x");
        let mut parser = EnvParser::new();
        let v = parser.file_mode("FILE_MODE", 0o755);
        assert_eq!(v.value, 0o755);
        let errors = parser.take_errors();
        assert!(errors[0].to_string().contains("octal file mode"));
        unset("FILE_MODE");
    }

    #[test]
    #[serial]
    fn test_flag_spellings() {
        let mut parser = EnvParser::new();
        for (raw, expected) in [("yes", true), ("ON", true), ("0", false), ("off", false)] {
            set("PARALLEL", raw);
            assert_eq!(parser.flag("PARALLEL", !expected).value, expected, "{raw}");
        }
        set("PARALLEL", "sometimes");
        assert!(parser.flag("PARALLEL", true).value);
        assert_eq!(parser.take_errors().len(), 1);
        unset("PARALLEL");
    }

    #[test]
    #[serial]
    fn test_snapshot_root_expands_tilde() {
        set("SNAPSHOT_ROOT", "~/dso-snaps");
        let mut parser = EnvParser::new();
        let v = parser.local_path("SNAPSHOT_ROOT", PathBuf::from("/var/lib/dso"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(v.value, home.join("dso-snaps"));
        }
        assert!(v.is_from_env());
        unset("SNAPSHOT_ROOT");
    }

    #[test]
    #[serial]
    fn test_service_names() {
        set("RESTART_SERVICES", " SpringBoard , backboardd,, ");
        let mut parser = EnvParser::new();
        let v = parser.service_names("RESTART_SERVICES", vec![]);
        assert_eq!(v.value, vec!["SpringBoard", "backboardd"]);

        set("RESTART_SERVICES", "SpringBoard,/usr/bin/killall");
        let v = parser.service_names("RESTART_SERVICES", vec!["lockdownd".into()]);
        assert_eq!(v.value, vec!["lockdownd"]);
        assert!(matches!(
            &parser.take_errors()[0],
            EnvError::BadServiceName { name, .. } if name == "/usr/bin/killall"
        ));
        unset("RESTART_SERVICES");
    }

    #[test]
    #[serial]
    fn test_log_level_is_lowercased() {
        set("LOG_LEVEL", "DEBUG");
        let mut parser = EnvParser::new();
        assert_eq!(parser.log_level("LOG_LEVEL", "info").value, "debug");
        set("LOG_LEVEL", "loud");
        assert_eq!(parser.log_level("LOG_LEVEL", "info").value, "info");
        assert!(parser.has_errors());
        unset("LOG_LEVEL");
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/dso"), PathBuf::from("/var/lib/dso"));
        assert_eq!(expand_tilde("~user/x"), PathBuf::from("~user/x"));
    }
}
