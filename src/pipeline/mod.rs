//! Pipeline interpreter: chain syntax → registry lookup → sequential execution.
//!
//! A chain like `fetch:prices -> summarize -> notify` is parsed into steps,
//! each step is resolved against the [`CommandRegistry`] and run as an
//! external process. The previous step's output reaches the next step through
//! the `TRIPWIRE_INPUT` environment variable. Every run, successful or not,
//! is appended to the bounded execution log.

pub mod interpreter;
pub mod registry;
pub mod syntax;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Millis;

pub use interpreter::{Pipeline, RunOptions, ENV_INPUT, ENV_STEP};
pub use registry::{CommandEntry, CommandRegistry};
pub use syntax::{escape_literal, parse_chain, render_chain, PipelineStep};

/// Errors from the pipeline layer.
///
/// Step failures are not errors: they are recorded in [`StepResult`].
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("chain has no steps: \"{chain}\"")]
    #[diagnostic(
        code(tripwire::pipeline::empty_chain),
        help("Write at least one command id, e.g. `status -> notify:done`.")
    )]
    EmptyChain { chain: String },

    #[error("cannot read command registry {path}: {source}")]
    #[diagnostic(
        code(tripwire::pipeline::registry_read),
        help("Create the registry file or point `pipeline.registry` in the config at it.")
    )]
    RegistryRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command registry {path}: {message}")]
    #[diagnostic(
        code(tripwire::pipeline::registry_invalid),
        help(
            "The registry maps a category to a list of {{ id, invocation }} entries. \
             Ids must be unique, non-empty and free of ':'."
        )
    )]
    InvalidRegistry { path: String, message: String },
}

/// Output of a step: parsed JSON when stdout was JSON, raw text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    Structured(serde_json::Value),
    Text(String),
}

impl StepOutput {
    /// Interpret captured stdout.
    pub fn from_stdout(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Self::Text(String::new());
        }
        match serde_json::from_str(trimmed) {
            Ok(value) => Self::Structured(value),
            Err(_) => Self::Text(stdout.trim_end_matches(['\n', '\r']).to_string()),
        }
    }

    /// Encoding used when handing the output to the next process.
    pub fn to_env_value(&self) -> String {
        match self {
            Self::Structured(v) => v.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    /// As a JSON value (text becomes a JSON string).
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Structured(v) => v.clone(),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_param: Option<String>,
    pub success: bool,
    /// Captured output, present whenever the process ran to exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failed,
}

/// Immutable record of one chain run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: String,
    /// Run number, continued across restarts from the persisted log.
    #[serde(default)]
    pub seq: u64,
    pub chain: String,
    pub steps: Vec<StepResult>,
    pub status: PipelineStatus,
    pub continue_on_error: bool,
    pub started_at: Millis,
    pub completed_at: Millis,
    /// The output last threaded forward (that of the last successful step).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<StepOutput>,
}

impl PipelineExecution {
    pub fn succeeded(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.success)
    }

    /// Short human summary, e.g. `failed: 2/3 steps ok (fetch: exit code 1)`.
    pub fn summary(&self) -> String {
        let ok = self.steps.iter().filter(|s| s.success).count();
        let status = match self.status {
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
        };
        let mut text = format!("{status}: {ok}/{} steps ok", self.steps.len());
        if let Some(first) = self.failed_steps().next() {
            text.push_str(&format!(
                " ({}: {})",
                first.command_id,
                first.error.as_deref().unwrap_or("failed")
            ));
        }
        text
    }
}
