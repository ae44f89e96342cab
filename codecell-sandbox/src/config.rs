//! Configuration for the sandbox manager

use crate::limits::ResourceLimits;
use crate::monitor::{AlertThresholds, DEFAULT_SAMPLE_INTERVAL};
use crate::validator::{ValidatorSettings, DEFAULT_MAX_SOURCE_BYTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Envelope used by `create_environment` when the caller does not pass one
    pub limits: ResourceLimits,
    pub monitor: MonitorConfig,
    pub manager: ManagerConfig,
    pub validator: ValidatorConfig,
    pub interpreters: InterpreterSettings,
}

/// Resource monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Fraction of a limit that raises a warning alert
    pub warning_threshold: f64,
    /// Fraction of a limit that raises a critical alert
    pub critical_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let thresholds = AlertThresholds::default();
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            warning_threshold: thresholds.warning,
            critical_threshold: thresholds.critical,
        }
    }
}

impl MonitorConfig {
    pub fn thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            warning: self.warning_threshold,
            critical: self.critical_threshold,
        }
    }
}

/// Environment manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long `terminate` waits for the pipeline before forcing the result
    #[serde(with = "humantime_serde")]
    pub cleanup_window: Duration,
    /// Wall-time slack past `maxExecutionTimeMs` before a finished run counts as terminated
    #[serde(with = "humantime_serde")]
    pub overshoot_tolerance: Duration,
    pub terminate_on_memory_critical: bool,
    pub terminate_on_cpu_critical: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_window: Duration::from_secs(2),
            overshoot_tolerance: Duration::from_millis(250),
            terminate_on_memory_critical: true,
            terminate_on_cpu_critical: false,
        }
    }
}

/// Validator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_source_bytes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

impl From<&ValidatorConfig> for ValidatorSettings {
    fn from(config: &ValidatorConfig) -> Self {
        ValidatorSettings {
            max_source_bytes: config.max_source_bytes,
        }
    }
}

/// Engine used for JavaScript snippets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JavaScriptBackend {
    #[default]
    Node,
    /// In-process isolate; needs the `v8` feature
    V8,
}

/// Interpreter programs for the process engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSettings {
    pub python: String,
    pub node: String,
    pub deno: String,
    pub shell: String,
    pub javascript_backend: JavaScriptBackend,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            node: "node".to_string(),
            deno: "deno".to_string(),
            shell: "/bin/sh".to_string(),
            javascript_backend: JavaScriptBackend::Node,
        }
    }
}

impl SandboxConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one the default path is used when present,
    /// otherwise defaults apply. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                tracing::debug!(path = %path.display(), "Loaded configuration");
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// `~/.config/codecell/config.toml` (platform config dir)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("codecell").join("config.toml"))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn apply_env_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, slot) in [
            ("CODECELL_PYTHON", &mut self.interpreters.python),
            ("CODECELL_NODE", &mut self.interpreters.node),
            ("CODECELL_DENO", &mut self.interpreters.deno),
            ("CODECELL_SHELL", &mut self.interpreters.shell),
        ] {
            if let Some(value) = var(key).filter(|v| !v.is_empty()) {
                *slot = value;
            }
        }
        if let Some(value) = var("CODECELL_SAMPLE_INTERVAL") {
            self.monitor.sample_interval = humantime_serde::re::humantime::parse_duration(&value)
                .map_err(|e| {
                    ConfigError::Invalid(format!("CODECELL_SAMPLE_INTERVAL '{}': {}", value, e))
                })?;
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let monitor = &self.monitor;
        if monitor.sample_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "monitor.sample_interval must be greater than zero".to_string(),
            ));
        }
        let in_range = |v: f64| v > 0.0 && v <= 1.0;
        if !in_range(monitor.warning_threshold) || !in_range(monitor.critical_threshold) {
            return Err(ConfigError::Invalid(
                "monitor thresholds must be within (0, 1]".to_string(),
            ));
        }
        if monitor.warning_threshold > monitor.critical_threshold {
            return Err(ConfigError::Invalid(
                "monitor.warning_threshold must not exceed critical_threshold".to_string(),
            ));
        }
        if self.validator.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "validator.max_source_bytes must be greater than zero".to_string(),
            ));
        }
        #[cfg(not(feature = "v8"))]
        if self.interpreters.javascript_backend == JavaScriptBackend::V8 {
            return Err(ConfigError::Invalid(
                "javascript_backend = \"v8\" requires the v8 feature".to_string(),
            ));
        }
        Ok(())
    }
}
