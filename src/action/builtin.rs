//! Built-in primitive handlers: `pipeline`, `shell`, `notify`.

use std::time::Duration;

use crate::pipeline::{RunOptions, StepOutput};
use crate::process::{self, ShellCommand};

use super::handler::{ActionHandler, ActionOutcome, HandlerContext};
use super::{ActionError, ActionItem, ActionResult};

/// Default `shell` action timeout.
const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;

/// Runs a command chain through the pipeline interpreter.
///
/// Params: `chain` (required), `continue_on_error` (bool), `input` (initial
/// input for the first step; strings stay text, anything else is structured).
pub struct PipelineHandler;

impl ActionHandler for PipelineHandler {
    fn action_type(&self) -> &str {
        "pipeline"
    }

    fn description(&self) -> &str {
        "Run a command chain like `a -> b:param`. Params: chain, continue_on_error."
    }

    fn execute(&self, item: &ActionItem, ctx: &mut HandlerContext<'_>) -> ActionResult<ActionOutcome> {
        let chain = item.require_str("chain")?;
        let options = RunOptions {
            continue_on_error: item.param_bool("continue_on_error"),
            input: item.params.get("input").map(|v| match v {
                serde_json::Value::String(s) => StepOutput::Text(s.clone()),
                other => StepOutput::Structured(other.clone()),
            }),
        };
        let execution = ctx
            .pipeline
            .run(chain, &options)
            .map_err(|e| ActionError::Execution {
                action_type: "pipeline".into(),
                message: e.to_string(),
            })?;
        let detail = serde_json::json!({
            "execution_id": execution.id,
            "final_output": execution.final_output.as_ref().map(StepOutput::to_value),
        });
        let summary = format!("pipeline {}: {}", execution.id, execution.summary());
        let outcome = if execution.succeeded() {
            ActionOutcome::ok(summary)
        } else {
            ActionOutcome::failed(summary)
        };
        Ok(outcome.with_detail(detail))
    }
}

/// Runs one shell command. Params: `command` (required), `timeout_secs`.
pub struct ShellHandler;

impl ActionHandler for ShellHandler {
    fn action_type(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a single shell command. Params: command, timeout_secs (default 30)."
    }

    fn execute(&self, item: &ActionItem, _ctx: &mut HandlerContext<'_>) -> ActionResult<ActionOutcome> {
        let command = item.require_str("command")?;
        let timeout =
            Duration::from_secs(item.param_u64("timeout_secs").unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS));
        let out = process::run(&ShellCommand::new(command, timeout)).map_err(|e| {
            ActionError::Execution {
                action_type: "shell".into(),
                message: e.to_string(),
            }
        })?;
        let detail = serde_json::json!({
            "exit_code": out.exit_code,
            "stdout": out.stdout,
            "stderr": out.stderr,
        });
        let outcome = if out.success() {
            ActionOutcome::ok(format!("`{command}` exited 0"))
        } else {
            ActionOutcome::failed(format!("`{command}`: {}", out.failure_message()))
        };
        Ok(outcome.with_detail(detail))
    }
}

/// Surfaces a message in the log for a human to read.
///
/// Params: `message`; falls back to the item's topic.
pub struct NotifyHandler;

impl ActionHandler for NotifyHandler {
    fn action_type(&self) -> &str {
        "notify"
    }

    fn description(&self) -> &str {
        "Record a message for the operator. Params: message."
    }

    fn execute(&self, item: &ActionItem, _ctx: &mut HandlerContext<'_>) -> ActionResult<ActionOutcome> {
        let message = item
            .param_str("message")
            .or(item.topic.as_deref())
            .ok_or(ActionError::MissingParam {
                action_type: "notify".into(),
                param: "message",
            })?;
        tracing::info!(action = %item.id, priority = %item.priority, "notify: {message}");
        Ok(ActionOutcome::ok(message.to_string()))
    }
}
