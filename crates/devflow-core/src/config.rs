// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration (§3.1, §4.10).
//!
//! Layered precedence, lowest to highest: compiled default, an optional
//! `devflow.yaml`/`devflow.toml` file, `DEVFLOW_*` environment variables,
//! then explicit CLI overrides. Each layer only overrides fields it
//! actually sets; an absent field falls through to the next layer.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Failures loading or parsing the layered run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

/// The fully resolved run configuration (§3.1).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub rate_limit_per_second: Option<f64>,
    pub fail_fast: bool,
    pub default_step_timeout_seconds: Option<u64>,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            rate_limit_per_second: None,
            fail_fast: true,
            default_step_timeout_seconds: None,
            log_level: "info".to_string(),
        }
    }
}

/// Overrides an embedder (the reference CLI) collected from its own flags.
/// Every field is optional: only flags the user actually passed should be
/// `Some`, so layering below can tell "explicitly set" from "default".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_concurrent: Option<usize>,
    pub rate_limit_per_second: Option<f64>,
    pub fail_fast: Option<bool>,
    pub default_step_timeout_seconds: Option<u64>,
    pub log_level: Option<String>,
}

/// The config file's on-disk shape. Every field optional; unknown fields are
/// rejected so typos in a `devflow.yaml` surface immediately rather than
/// being silently ignored (§4.10).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    rate_limit_per_second: Option<f64>,
    #[serde(default)]
    fail_fast: Option<bool>,
    #[serde(default)]
    default_step_timeout_seconds: Option<u64>,
    #[serde(default)]
    log_level: Option<String>,
}

impl EngineConfig {
    /// Resolves the final configuration (§4.10: `load(cli_overrides,
    /// config_path) -> EngineConfig | ConfigError`).
    ///
    /// `config_path` is read only if it exists; a missing file at the
    /// default location is not an error, but a path explicitly passed via
    /// `--config` that does not exist is.
    pub fn load(cli: CliOverrides, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "config file not found",
                    ),
                });
            }
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let file: FileConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            config.apply_file(file);
        }

        config.apply_env()?;
        config.apply_cli(cli);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.max_concurrent {
            self.max_concurrent = v;
        }
        if let Some(v) = file.rate_limit_per_second {
            self.rate_limit_per_second = Some(v);
        }
        if let Some(v) = file.fail_fast {
            self.fail_fast = v;
        }
        if let Some(v) = file.default_step_timeout_seconds {
            self.default_step_timeout_seconds = Some(v);
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("DEVFLOW_MAX_CONCURRENT") {
            self.max_concurrent = v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "DEVFLOW_MAX_CONCURRENT",
                value: v,
            })?;
        }
        if let Ok(v) = std::env::var("DEVFLOW_RATE_LIMIT_PER_SECOND") {
            self.rate_limit_per_second = Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "DEVFLOW_RATE_LIMIT_PER_SECOND",
                value: v,
            })?);
        }
        if let Ok(v) = std::env::var("DEVFLOW_FAIL_FAST") {
            self.fail_fast = v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "DEVFLOW_FAIL_FAST",
                value: v,
            })?;
        }
        if let Ok(v) = std::env::var("DEVFLOW_DEFAULT_STEP_TIMEOUT_SECONDS") {
            self.default_step_timeout_seconds = Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "DEVFLOW_DEFAULT_STEP_TIMEOUT_SECONDS",
                value: v,
            })?);
        }
        if let Ok(v) = std::env::var("DEVFLOW_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(v) = cli.max_concurrent {
            self.max_concurrent = v;
        }
        if let Some(v) = cli.rate_limit_per_second {
            self.rate_limit_per_second = Some(v);
        }
        if let Some(v) = cli.fail_fast {
            self.fail_fast = v;
        }
        if let Some(v) = cli.default_step_timeout_seconds {
            self.default_step_timeout_seconds = Some(v);
        }
        if let Some(v) = cli.log_level {
            self.log_level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        std::env::remove_var("DEVFLOW_MAX_CONCURRENT");
        let config = EngineConfig::load(CliOverrides::default(), None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn file_overrides_default() {
        let dir = std::env::temp_dir().join(format!("devflow-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devflow.yaml");
        std::fs::write(&path, "max_concurrent: 4\nfail_fast: false\n").unwrap();

        let config = EngineConfig::load(CliOverrides::default(), Some(&path)).unwrap();
        assert_eq!(config.max_concurrent, 4);
        assert!(!config.fail_fast);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cli_wins_over_file() {
        let dir = std::env::temp_dir().join(format!("devflow-cfg-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devflow.yaml");
        std::fs::write(&path, "max_concurrent: 4\n").unwrap();

        let cli = CliOverrides {
            max_concurrent: Some(20),
            ..Default::default()
        };
        let config = EngineConfig::load(cli, Some(&path)).unwrap();
        assert_eq!(config.max_concurrent, 20);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_explicit_config_path_is_an_error() {
        let dir = std::env::temp_dir().join(format!("devflow-cfg-test-missing-{}", std::process::id()));
        let path = dir.join("does-not-exist.yaml");

        let err = EngineConfig::load(CliOverrides::default(), Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn file_rejects_unknown_fields() {
        let dir = std::env::temp_dir().join(format!("devflow-cfg-test3-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devflow.yaml");
        std::fs::write(&path, "bogus_field: true\n").unwrap();

        let err = EngineConfig::load(CliOverrides::default(), Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
