//! Daemon configuration
//!
//! Loaded once at startup from a JSON file. Every field has a default so an
//! absent file yields a usable configuration.

use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH: &str = "/etc/portwarden/config.json";
pub const RULES_PATH: &str = "/etc/portwarden/rules.json";

/// Mark carried by denied flows, matched by the drop rule.
pub const DEFAULT_DROP_MARK: u32 = 0x18BA5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config {0} is a symlink")]
    Symlink(PathBuf),
}

/// What happens to connections no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Log and allow.
    Observe,
    /// Deny and mark.
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    Allow,
    Deny,
}

/// External program told about every undecided connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotifierConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub rules_path: PathBuf,
    pub drop_mark: u32,
    pub policy_timeout_ms: u64,
    pub notifier: Option<NotifierConfig>,
    pub fallback_verdict: Fallback,
    pub channel_capacity: usize,
    pub drain_timeout_ms: u64,
    pub dns_cache_capacity: usize,
    pub dns_max_age_secs: u64,
    pub monitor_refresh_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Observe,
            rules_path: PathBuf::from(RULES_PATH),
            drop_mark: DEFAULT_DROP_MARK,
            policy_timeout_ms: 1000,
            notifier: None,
            fallback_verdict: Fallback::Allow,
            channel_capacity: 0,
            drain_timeout_ms: 2000,
            dns_cache_capacity: 4096,
            dns_max_age_secs: 3600,
            monitor_refresh_ms: 100,
        }
    }
}

impl Config {
    /// Loads the config at `path`.
    ///
    /// A missing or symlinked file falls back to defaults. Read and parse
    /// failures are errors only when `explicit` is set, i.e. the operator
    /// named the file on the command line.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        if !path.exists() {
            if explicit {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        // Reject symlinked config files
        if let Ok(metadata) = fs::symlink_metadata(path) {
            if metadata.file_type().is_symlink() {
                if explicit {
                    return Err(ConfigError::Symlink(path.to_path_buf()));
                }
                warn!("Config file at {} is a symlink, using defaults", path.display());
                return Ok(Self::default());
            }
        }

        let parsed = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
            .and_then(|content| {
                Self::parse(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            });

        match parsed {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if !explicit => {
                warn!("{}, using defaults", e);
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn dns_max_age(&self) -> Duration {
        Duration::from_secs(self.dns_max_age_secs)
    }

    pub fn monitor_refresh(&self) -> Duration {
        Duration::from_millis(self.monitor_refresh_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.mode, Mode::Observe);
        assert_eq!(config.drop_mark, DEFAULT_DROP_MARK);
        assert_eq!(config.fallback_verdict, Fallback::Allow);
        assert_eq!(config.channel_capacity, 0);
        assert!(config.notifier.is_none());
    }

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"{
                "mode": "enforce",
                "drop_mark": 42,
                "policy_timeout_ms": 250,
                "notifier": {"program": "notify-send", "args": ["-t", "2000"]},
                "fallback_verdict": "deny"
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Enforce);
        assert_eq!(config.drop_mark, 42);
        assert_eq!(config.policy_timeout(), Duration::from_millis(250));
        assert_eq!(config.fallback_verdict, Fallback::Deny);
        let notifier = config.notifier.unwrap();
        assert_eq!(notifier.program, "notify-send");
        assert_eq!(notifier.args, vec!["-t", "2000"]);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Config::parse(r#"{"mode": "paranoid"}"#).is_err());
    }

    #[test]
    fn missing_file_falls_back_unless_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(Config::load(&path, false).is_ok());
        assert!(matches!(
            Config::load(&path, true),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn malformed_file_is_fatal_only_when_explicit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let config = Config::load(file.path(), false).unwrap();
        assert_eq!(config.mode, Mode::Observe);
        assert!(matches!(
            Config::load(file.path(), true),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn symlinked_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.json");
        fs::write(&target, r#"{"mode": "enforce"}"#).unwrap();
        let link = dir.path().join("config.json");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(Config::load(&link, false).unwrap().mode, Mode::Observe);
        assert!(matches!(
            Config::load(&link, true),
            Err(ConfigError::Symlink(_))
        ));
    }
}
