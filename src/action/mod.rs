//! Action queue and dispatcher.
//!
//! - **Items** ([`ActionItem`]): durable units of work with a type, parameters
//!   and a priority tier
//! - **Queue** ([`ActionQueue`]): the persisted backlog, ordered by priority
//!   tier then creation time
//! - **Handlers** ([`ActionHandler`]): executors registered by action type
//! - **Dispatcher** ([`Dispatcher`]): the single writer of status
//!   transitions after creation

pub mod builtin;
pub mod dispatch;
pub mod handler;
pub mod queue;
pub mod task;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Millis;
use crate::oracle::OracleError;
use crate::store::StoreError;

pub use dispatch::{ActionLogEntry, Dispatcher};
pub use handler::{ActionHandler, ActionOutcome, HandlerContext, HandlerRegistry};
pub use queue::ActionQueue;
pub use task::{MAX_PLAN_STEPS, TASK_ACTION, TaskHandler};

/// Named action parameters.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Errors specific to the action layer.
#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    #[error("no handler for action type \"{action_type}\"")]
    #[diagnostic(
        code(tripwire::action::no_handler),
        help("Register a handler for this type, or fix the `type` in the trigger's action.")
    )]
    HandlerNotFound { action_type: String },

    #[error("action not found: \"{id}\"")]
    #[diagnostic(
        code(tripwire::action::not_found),
        help("List the backlog with `tripwire queue list`.")
    )]
    NotFound { id: String },

    #[error("missing parameter \"{param}\" for {action_type} action")]
    #[diagnostic(code(tripwire::action::missing_param))]
    MissingParam {
        action_type: String,
        param: &'static str,
    },

    #[error("{action_type} action failed: {message}")]
    #[diagnostic(code(tripwire::action::execution))]
    Execution {
        action_type: String,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type ActionResult<T> = std::result::Result<T, ActionError>;

/// Priority tier. Dispatch order is critical, high, medium, low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Dispatch rank: lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Whether this tier is as urgent as `threshold` or more.
    pub fn is_at_least(self, threshold: Priority) -> bool {
        self.rank() <= threshold.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown priority \"{s}\" (critical, high, medium, low)"))
    }
}

/// Lifecycle state of an action item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Queued,
    Executing,
    Succeeded,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Params,
    pub priority: Priority,
    pub status: ActionStatus,
    pub created_at: Millis,
    /// Monotonic enqueue counter, breaks `created_at` ties.
    pub seq: u64,
    /// Trigger id, or `manual`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionItem {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Boolean parameter; accepts JSON booleans and `"true"`/`"1"`/`"yes"`.
    pub fn param_bool(&self, key: &str) -> bool {
        match self.params.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            _ => false,
        }
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.params.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Required string parameter.
    pub fn require_str(&self, key: &'static str) -> ActionResult<&str> {
        self.param_str(key).ok_or_else(|| ActionError::MissingParam {
            action_type: self.action_type.clone(),
            param: key,
        })
    }

    /// Sort key for dispatch: tier, then creation time, then enqueue order.
    pub fn dispatch_key(&self) -> (u8, Millis, u64) {
        (self.priority.rank(), self.created_at, self.seq)
    }
}

/// Request to enqueue a new action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub action_type: String,
    pub params: Params,
    pub priority: Priority,
    pub origin: Option<String>,
    pub topic: Option<String>,
}

impl NewAction {
    pub fn new(action_type: impl Into<String>, priority: Priority) -> Self {
        Self {
            action_type: action_type.into(),
            priority,
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_and_parsing() {
        assert!(Priority::Critical.is_at_least(Priority::High));
        assert!(Priority::High.is_at_least(Priority::High));
        assert!(!Priority::Medium.is_at_least(Priority::High));
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"critical\"");
    }

    #[test]
    fn param_helpers() {
        let item = ActionItem {
            id: "a".into(),
            action_type: "shell".into(),
            params: Params::from([
                ("flag".to_string(), serde_json::json!("yes")),
                ("n".to_string(), serde_json::json!("15")),
            ]),
            priority: Priority::Low,
            status: ActionStatus::Queued,
            created_at: 0,
            seq: 0,
            origin: None,
            topic: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        assert!(item.param_bool("flag"));
        assert!(!item.param_bool("missing"));
        assert_eq!(item.param_u64("n"), Some(15));
        assert!(matches!(
            item.require_str("command"),
            Err(ActionError::MissingParam { param: "command", .. })
        ));
    }
}
