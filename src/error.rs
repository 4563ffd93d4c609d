//! Top-level diagnostic error type.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives;
//! [`TripwireError`] wraps them so codes and help text reach the user intact.

use miette::Diagnostic;
use thiserror::Error;

use crate::action::ActionError;
use crate::config::ConfigError;
use crate::observe::SourceError;
use crate::oracle::OracleError;
use crate::paths::PathError;
use crate::pipeline::PipelineError;
use crate::process::ProcessError;
use crate::store::StoreError;
use crate::trigger::TriggerError;

#[derive(Debug, Error, Diagnostic)]
pub enum TripwireError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Paths(#[from] PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Action(#[from] ActionError),
}

pub type TripwireResult<T> = std::result::Result<T, TripwireError>;
