//! Process-wide configuration, loaded once at startup and immutable after.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::transport::tcp::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum real time between scheduler passes; shorter gaps are skipped.
    pub tick_floor: Duration,
    /// Exchange cadence inside the pause barrier.
    pub pause_exchange_interval: Duration,
    /// Sustained participant silence that tears the session down.
    pub connection_timeout: Duration,
    /// How long the host keeps answering after ending, waiting for the
    /// terminate flag to be delivered.
    pub termination_grace: Duration,
    /// Upper bound accepted for scenario priorities.
    pub max_priority: u32,
    pub journal_dir: PathBuf,
    pub scenario_dir: PathBuf,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_floor: Duration::from_millis(1),
            pause_exchange_interval: Duration::from_millis(1),
            connection_timeout: Duration::from_secs(5),
            termination_grace: Duration::from_secs(10),
            max_priority: 10_000,
            journal_dir: PathBuf::from("logs"),
            scenario_dir: PathBuf::from("scenarios"),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: invalid value for '{key}'")]
    Value { line: usize, key: String },
}

impl Config {
    /// Parse a `key=value` configuration file. Missing keys keep their
    /// defaults; unknown keys are ignored with a debug note.
    pub fn parse_str(source: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for (index, raw_line) in source.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let bad = || ConfigError::Value {
                line,
                key: key.to_string(),
            };
            match key {
                "tick_floor_ms" => {
                    config.tick_floor =
                        Duration::from_millis(value.parse().map_err(|_| bad())?);
                }
                "pause_exchange_ms" => {
                    config.pause_exchange_interval =
                        Duration::from_millis(value.parse().map_err(|_| bad())?);
                }
                "connection_timeout_ms" => {
                    config.connection_timeout =
                        Duration::from_millis(value.parse().map_err(|_| bad())?);
                }
                "termination_grace_ms" => {
                    config.termination_grace =
                        Duration::from_millis(value.parse().map_err(|_| bad())?);
                }
                "max_priority" => {
                    config.max_priority = value.parse().map_err(|_| bad())?;
                }
                "journal_dir" => config.journal_dir = PathBuf::from(value),
                "scenario_dir" => config.scenario_dir = PathBuf::from(value),
                "port" => config.port = value.parse().map_err(|_| bad())?,
                other => debug!(key = other, "ignoring unknown configuration key"),
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse_str(&std::fs::read_to_string(path)?)
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.tick_floor, Duration::from_millis(1));
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.termination_grace, Duration::from_secs(10));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_known_keys_and_ignores_unknown_ones() {
        let config = Config::parse_str(
            "# comment\nconnection_timeout_ms=250\nmax_priority=500\nlanguage=en\nport=4000\n",
        )
        .unwrap();
        assert_eq!(config.connection_timeout, Duration::from_millis(250));
        assert_eq!(config.max_priority, 500);
        assert_eq!(config.port, 4000);
        assert_eq!(config.tick_floor, Duration::from_millis(1));
    }

    #[test]
    fn bad_values_are_reported_with_their_line() {
        let err = Config::parse_str("tick_floor_ms=fast\n").unwrap_err();
        match err {
            ConfigError::Value { line, key } => {
                assert_eq!(line, 1);
                assert_eq!(key, "tick_floor_ms");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
