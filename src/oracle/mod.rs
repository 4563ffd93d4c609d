//! Reasoning oracle contract: ask an external planner to decompose a task.
//!
//! The oracle receives a [`PlanRequest`] and answers with free text that must
//! contain either a needs-human signal or an ordered list of steps:
//!
//! ```json
//! {"status": "needs_human", "reason": "..."}
//! [{"action": "shell", "params": {"command": "..."}, "description": "..."}]
//! ```
//!
//! [`decode_plan`] turns that text into a [`PlanResponse`] strictly: unknown
//! action types and malformed steps are errors, not silently dropped.

pub mod ollama;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::action::Params;

pub use ollama::{OllamaOracle, OracleConfig};

/// Errors from the oracle subsystem.
#[derive(Debug, Error, Diagnostic)]
pub enum OracleError {
    #[error("reasoning oracle is not available: {detail}")]
    #[diagnostic(
        code(tripwire::oracle::unavailable),
        help("Start Ollama with `ollama serve`, or disable `task` actions in the config.")
    )]
    Unavailable { detail: String },

    #[error("oracle request failed: {message}")]
    #[diagnostic(
        code(tripwire::oracle::request_failed),
        help("Check that the oracle is running and the model is pulled.")
    )]
    RequestFailed { message: String },

    #[error("oracle request timed out after {timeout_secs}s")]
    #[diagnostic(
        code(tripwire::oracle::timeout),
        help("Increase `oracle.timeout_secs` or use a smaller model.")
    )]
    Timeout { timeout_secs: u64 },

    #[error("failed to parse oracle plan: {message}")]
    #[diagnostic(
        code(tripwire::oracle::parse),
        help("The oracle returned text that is not a needs-human signal or a list of steps.")
    )]
    Parse { message: String },

    #[error("oracle planned unknown action \"{action}\" (allowed: {allowed})")]
    #[diagnostic(
        code(tripwire::oracle::unknown_action),
        help("The plan names an action type that has no registered handler.")
    )]
    UnknownAction { action: String, allowed: String },
}

/// What the task handler asks the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub task_description: String,
    pub allowed_action_types: Vec<String>,
    pub max_steps: usize,
}

impl PlanRequest {
    /// Render as a prompt for a text-completion oracle.
    pub fn to_prompt(&self, action_docs: &[(&str, &str)]) -> String {
        let mut prompt = String::new();
        prompt.push_str("Task:\n");
        prompt.push_str(&self.task_description);
        prompt.push_str("\n\nYou may use only these actions:\n");
        for action in &self.allowed_action_types {
            let doc = action_docs
                .iter()
                .find(|(name, _)| name == action)
                .map(|(_, d)| *d)
                .unwrap_or("");
            prompt.push_str(&format!("- {action}: {doc}\n"));
        }
        prompt.push_str(&format!(
            "\nRespond with raw JSON only. Either a list of at most {} steps:\n\
             [{{\"action\": \"<action>\", \"params\": {{...}}, \"description\": \"<why>\"}}]\n\
             or, if the task cannot be done safely with these actions:\n\
             {{\"status\": \"needs_human\", \"reason\": \"<why>\"}}\n",
            self.max_steps
        ));
        prompt
    }
}

/// One step of an oracle plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub action: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub description: String,
}

/// Decoded oracle answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanResponse {
    NeedsHuman { reason: String },
    Steps { steps: Vec<PlannedStep> },
}

/// An external planner.
pub trait ReasoningOracle: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Send the request and return the oracle's raw answer text.
    ///
    /// `action_docs` pairs each allowed action with its description.
    fn request_plan(
        &self,
        request: &PlanRequest,
        action_docs: &[(&str, &str)],
    ) -> Result<String, OracleError>;
}

/// Decode raw oracle text.
///
/// `known_actions` is every action type the plan may name. Plans longer than
/// `max_steps` are truncated.
pub fn decode_plan(
    raw: &str,
    known_actions: &[&str],
    max_steps: usize,
) -> Result<PlanResponse, OracleError> {
    let json = extract_json(raw).ok_or_else(|| OracleError::Parse {
        message: "no JSON object or array found in response".into(),
    })?;
    let value: Value = serde_json::from_str(json).map_err(|e| OracleError::Parse {
        message: format!("JSON parse error: {e}"),
    })?;

    let raw_steps = match value {
        Value::Object(mut map) => {
            if map.get("status").and_then(Value::as_str) == Some("needs_human") {
                let reason = map
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("no reason given")
                    .to_string();
                return Ok(PlanResponse::NeedsHuman { reason });
            }
            match map.remove("steps") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(OracleError::Parse {
                        message: "object response is neither needs_human nor {\"steps\": [...]}"
                            .into(),
                    });
                }
            }
        }
        Value::Array(items) => items,
        other => {
            return Err(OracleError::Parse {
                message: format!("expected object or array, got {other}"),
            });
        }
    };

    if raw_steps.len() > max_steps {
        tracing::warn!(planned = raw_steps.len(), max_steps, "oracle plan truncated");
    }
    // Steps past the cap are dropped unread, so they cannot reject the plan.
    let steps = raw_steps
        .into_iter()
        .take(max_steps)
        .enumerate()
        .map(|(i, v)| decode_step(i, v, known_actions))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PlanResponse::Steps { steps })
}

fn decode_step(index: usize, value: Value, known: &[&str]) -> Result<PlannedStep, OracleError> {
    let Value::Object(mut map) = value else {
        return Err(OracleError::Parse {
            message: format!("step {index} is not an object"),
        });
    };
    let action = match map.remove("action") {
        Some(Value::String(a)) if !a.trim().is_empty() => a.trim().to_string(),
        _ => {
            return Err(OracleError::Parse {
                message: format!("step {index} has no \"action\" string"),
            });
        }
    };
    if !known.contains(&action.as_str()) {
        return Err(OracleError::UnknownAction {
            action,
            allowed: known.join(", "),
        });
    }
    let params = match map.remove("params") {
        None | Some(Value::Null) => Params::new(),
        Some(Value::Object(p)) => p.into_iter().collect(),
        Some(_) => {
            return Err(OracleError::Parse {
                message: format!("step {index} \"params\" is not an object"),
            });
        }
    };
    let description = map
        .remove("description")
        .and_then(|d| d.as_str().map(str::to_string))
        .unwrap_or_default();
    Ok(PlannedStep {
        action,
        params,
        description,
    })
}

/// Find the outermost JSON object or array in text that may carry prose or
/// code fences around it.
fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let start = trimmed.find(['{', '['])?;
    let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    let end = trimmed.rfind(close)?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &[&str] = &["shell", "notify", "task"];

    #[test]
    fn decodes_needs_human() {
        let plan = decode_plan(
            r#"{"status": "needs_human", "reason": "requires a signature"}"#,
            KNOWN,
            3,
        )
        .unwrap();
        assert_eq!(
            plan,
            PlanResponse::NeedsHuman {
                reason: "requires a signature".into()
            }
        );
    }

    #[test]
    fn decodes_steps_inside_prose() {
        let raw = "Sure! Here is the plan:\n```json\n[\
            {\"action\": \"shell\", \"params\": {\"command\": \"ls\"}, \"description\": \"look\"},\
            {\"action\": \"notify\", \"params\": {\"message\": \"done\"}}\
        ]\n```";
        let PlanResponse::Steps { steps } = decode_plan(raw, KNOWN, 3).unwrap() else {
            panic!("expected steps");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].params["command"], "ls");
        assert_eq!(steps[1].description, "");
    }

    #[test]
    fn accepts_wrapped_steps_object() {
        let raw = r#"{"steps": [{"action": "notify"}]}"#;
        assert!(matches!(
            decode_plan(raw, KNOWN, 3).unwrap(),
            PlanResponse::Steps { steps } if steps.len() == 1
        ));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = decode_plan(r#"[{"action": "launch_rocket"}]"#, KNOWN, 3).unwrap_err();
        assert!(matches!(err, OracleError::UnknownAction { action, .. } if action == "launch_rocket"));
    }

    #[test]
    fn malformed_responses_are_parse_errors() {
        for raw in [
            "I cannot help with that.",
            "[1, 2]",
            r#"[{"params": {}}]"#,
            r#"[{"action": "shell", "params": "ls"}]"#,
            r#"{"status": "ok"}"#,
            "{broken",
        ] {
            assert!(
                matches!(decode_plan(raw, KNOWN, 3), Err(OracleError::Parse { .. })),
                "expected parse error for {raw}"
            );
        }
    }

    #[test]
    fn long_plans_are_truncated() {
        let raw = r#"[{"action":"notify"},{"action":"notify"},{"action":"notify"},{"action":"shell"}]"#;
        let PlanResponse::Steps { steps } = decode_plan(raw, KNOWN, 3).unwrap() else {
            panic!("expected steps");
        };
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.action == "notify"));
    }

    #[test]
    fn steps_past_the_cap_are_not_validated() {
        let raw = r#"[{"action":"notify"},{"action":"shell"},{"action":"notify"},{"action":"format_disk"}, 7]"#;
        let PlanResponse::Steps { steps } = decode_plan(raw, KNOWN, 3).unwrap() else {
            panic!("expected steps");
        };
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].action, "shell");
    }

    #[test]
    fn prompt_lists_allowed_actions_and_cap() {
        let req = PlanRequest {
            task_description: "Clean the tmp dir".into(),
            allowed_action_types: vec!["shell".into()],
            max_steps: 3,
        };
        let prompt = req.to_prompt(&[("shell", "run a command")]);
        assert!(prompt.contains("- shell: run a command"));
        assert!(prompt.contains("at most 3 steps"));
        assert!(prompt.contains("needs_human"));
    }
}
