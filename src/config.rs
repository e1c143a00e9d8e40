//! Store configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Limits;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub durability: DurabilityConfig,
    pub logging: LoggingConfig,
}

/// When appends are acknowledged relative to fsync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// fsync before every acknowledgement.
    #[default]
    Synchronous,
    /// Group acknowledgements behind one fsync per flush threshold.
    Batched,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    pub mode: WriteMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::default(),
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_roundtrip() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.durability.mode, WriteMode::Synchronous);
        assert!(config.logging.stdout);

        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.durability.mode, config.durability.mode);
        assert_eq!(back.limits, config.limits);
    }

    #[test]
    fn write_mode_names_are_snake_case() {
        let mode: WriteMode = serde_json::from_str(r#""batched""#).unwrap();
        assert_eq!(mode, WriteMode::Batched);
    }
}
