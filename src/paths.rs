//! XDG-compliant path resolution for tripwire.
//!
//! Config lives under `$XDG_CONFIG_HOME/tripwire/`, persisted loop state
//! (cooldowns, backlog, logs) under `$XDG_STATE_HOME/tripwire/`.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(tripwire::paths::no_home),
        help("Set the HOME environment variable, or pass --config and --state-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(tripwire::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Resolved directories for one tripwire instance.
#[derive(Debug, Clone)]
pub struct TripwirePaths {
    /// `$XDG_CONFIG_HOME/tripwire/`
    pub config_dir: PathBuf,
    /// `$XDG_STATE_HOME/tripwire/`
    pub state_dir: PathBuf,
}

impl TripwirePaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join("tripwire");

        let state_dir = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/state"))
            .join("tripwire");

        Ok(Self {
            config_dir,
            state_dir,
        })
    }

    /// Paths rooted at explicit directories (tests, `--state-dir`).
    pub fn with_dirs(config_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Create the config and state directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [&self.config_dir, &self.state_dir] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("tripwire.toml")
    }

    pub fn cooldowns_file(&self) -> PathBuf {
        self.state_dir.join("cooldowns.json")
    }

    pub fn backlog_file(&self) -> PathBuf {
        self.state_dir.join("backlog.json")
    }

    pub fn action_log_file(&self) -> PathBuf {
        self.state_dir.join("action-log.json")
    }

    pub fn pipeline_log_file(&self) -> PathBuf {
        self.state_dir.join("pipeline-log.json")
    }

    pub fn trigger_log_file(&self) -> PathBuf {
        self.state_dir.join("trigger-log.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_files_live_in_state_dir() {
        let paths = TripwirePaths::with_dirs("/cfg", "/state");
        assert_eq!(paths.config_file(), PathBuf::from("/cfg/tripwire.toml"));
        assert_eq!(paths.cooldowns_file(), PathBuf::from("/state/cooldowns.json"));
        assert_eq!(paths.backlog_file(), PathBuf::from("/state/backlog.json"));
        assert_eq!(
            paths.pipeline_log_file(),
            PathBuf::from("/state/pipeline-log.json")
        );
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = TripwirePaths::with_dirs(dir.path().join("c"), dir.path().join("s"));
        paths.ensure_dirs().unwrap();
        paths.ensure_dirs().unwrap();
        assert!(paths.state_dir.is_dir());
    }
}
