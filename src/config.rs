//! `tripwire.toml`: sources, triggers, dispatch policy and oracle settings.
//!
//! ```toml
//! [dispatch]
//! auto_dispatch = "high"
//!
//! [pipeline]
//! registry = "commands.toml"
//!
//! [[sources]]
//! id = "market"
//! kind = "quote"
//! command = "fetch-quotes --json"
//! interval_secs = 60
//!
//! [[triggers]]
//! id = "big-move"
//! kinds = ["quote"]
//! topic = "{symbol} moved {change_pct}%"
//! priority = "high"
//! condition = { op = "greater_than", field = "change_pct", value = 5 }
//! action = { type = "pipeline", params = { chain = "report:{symbol}" } }
//! ```
//!
//! Every field has a default, so a missing file is a valid empty config.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::Priority;
use crate::oracle::OracleConfig;
use crate::trigger::TriggerDefinition;

/// Errors from loading the config file.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(tripwire::config::read),
        help("Ensure the config file is readable, or remove it to run with defaults.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(tripwire::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("invalid config: {message}")]
    #[diagnostic(code(tripwire::config::invalid))]
    Invalid { message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which queued items the loop dispatches on its own after each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoDispatch {
    /// Never; everything waits for `tripwire queue run`.
    None,
    Critical,
    #[default]
    High,
    Medium,
    Low,
}

impl AutoDispatch {
    /// The minimum tier dispatched automatically, if any.
    pub fn threshold(self) -> Option<Priority> {
        match self {
            Self::None => None,
            Self::Critical => Some(Priority::Critical),
            Self::High => Some(Priority::High),
            Self::Medium => Some(Priority::Medium),
            Self::Low => Some(Priority::Low),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub auto_dispatch: AutoDispatch,
    /// Upper bound on items dispatched in one cycle.
    pub max_per_cycle: usize,
    /// Finished items retained in the backlog.
    pub keep_finished: usize,
    /// Seconds between dispatch ticks in watch mode.
    pub tick_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_dispatch: AutoDispatch::default(),
            max_per_cycle: 10,
            keep_finished: crate::action::queue::DEFAULT_KEEP_FINISHED,
            tick_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Command registry file, relative to the config directory.
    pub registry: PathBuf,
    pub step_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            registry: PathBuf::from("commands.toml"),
            step_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Capacity of each bounded log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub actions: usize,
    pub pipelines: usize,
    pub triggers: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            actions: 100,
            pipelines: 100,
            triggers: 100,
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

fn default_source_timeout_secs() -> u64 {
    30
}

/// A `[[sources]]` entry: a shell command sampled on an interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Kind for records that don't name their own.
    pub kind: String,
    pub command: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
}

impl SourceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub pipeline: PipelineConfig,
    pub oracle: OracleConfig,
    pub history: HistoryConfig,
    pub sources: Vec<SourceConfig>,
    pub triggers: Vec<TriggerDefinition>,
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let shown = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %shown, "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: shown,
                    source: e,
                });
            }
        };
        let config = Self::parse(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: shown,
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: String::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() || source.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("source \"{}\" needs a non-empty id and command", source.id),
                });
            }
            if !ids.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("source id \"{}\" is declared more than once", source.id),
                });
            }
        }
        if self.dispatch.max_per_cycle == 0 {
            return Err(ConfigError::Invalid {
                message: "dispatch.max_per_cycle must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// The registry path, resolved against `config_dir` when relative.
    pub fn registry_path(&self, config_dir: &Path) -> PathBuf {
        if self.pipeline.registry.is_absolute() {
            self.pipeline.registry.clone()
        } else {
            config_dir.join(&self.pipeline.registry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("tripwire.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.dispatch.auto_dispatch.threshold(), Some(Priority::High));
    }

    #[test]
    fn full_example_parses() {
        let config = Config::parse(
            r#"
            [dispatch]
            auto_dispatch = "none"

            [oracle]
            enabled = false

            [[sources]]
            id = "market"
            kind = "quote"
            command = "echo '{}'"

            [[triggers]]
            id = "big-move"
            kinds = ["quote"]
            priority = "critical"
            cooldown_secs = 600
            condition = { op = "greater_than", field = "change_pct", value = 5 }
            action = { type = "pipeline", params = { chain = "report:{symbol}" } }
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatch.auto_dispatch.threshold(), None);
        assert!(!config.oracle.enabled);
        assert_eq!(config.sources[0].interval_secs, 60);
        assert_eq!(config.triggers[0].priority, Priority::Critical);
        assert_eq!(config.triggers[0].action.action_type, "pipeline");
        assert_eq!(config.triggers[0].action.params["chain"], "report:{symbol}");
    }

    #[test]
    fn duplicate_sources_are_invalid() {
        let err = Config::parse(
            r#"
            [[sources]]
            id = "a"
            kind = "k"
            command = "true"
            [[sources]]
            id = "a"
            kind = "k"
            command = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn bad_toml_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tripwire.toml");
        std::fs::write(&path, "[dispatch\n").unwrap();
        match Config::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert!(p.ends_with("tripwire.toml")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn relative_registry_resolves_against_config_dir() {
        let config = Config::default();
        assert_eq!(
            config.registry_path(Path::new("/etc/tripwire")),
            PathBuf::from("/etc/tripwire/commands.toml")
        );
    }
}
