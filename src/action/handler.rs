//! Handler trait and registry.
//!
//! Handlers are the dispatcher's interface to side effects. Each implements
//! [`ActionHandler`] and is registered under its action type in a
//! [`HandlerRegistry`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::oracle::ReasoningOracle;
use crate::pipeline::Pipeline;

use super::{ActionError, ActionItem, ActionResult};

/// What a handler reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    /// One-line description of what happened.
    pub summary: String,
    /// Structured result detail for the action log.
    #[serde(default)]
    pub detail: serde_json::Value,
    /// The handler declined and wants a human to take over.
    #[serde(default)]
    pub needs_human: bool,
}

impl ActionOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            detail: serde_json::Value::Null,
            needs_human: false,
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(summary)
        }
    }

    pub fn needs_human(reason: impl Into<String>) -> Self {
        Self {
            needs_human: true,
            ..Self::ok(format!("needs human: {}", reason.into()))
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Everything a handler may reach while executing.
pub struct HandlerContext<'a> {
    pub pipeline: &'a mut Pipeline,
    pub oracle: Option<&'a dyn ReasoningOracle>,
    pub handlers: &'a HandlerRegistry,
}

/// An executor for one action type.
pub trait ActionHandler: Send + Sync {
    /// The action type this handler serves.
    fn action_type(&self) -> &str;

    /// What this handler does, shown to the planning oracle.
    fn description(&self) -> &str;

    /// Execute the action.
    fn execute(&self, item: &ActionItem, ctx: &mut HandlerContext<'_>)
    -> ActionResult<ActionOutcome>;
}

/// Registry of handlers keyed by action type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Box<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `pipeline`, `shell`, `notify` and `task`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(super::builtin::PipelineHandler));
        reg.register(Box::new(super::builtin::ShellHandler));
        reg.register(Box::new(super::builtin::NotifyHandler));
        reg.register(Box::new(super::task::TaskHandler));
        reg
    }

    /// Register a handler. An existing handler of the same type is replaced.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        self.handlers
            .insert(handler.action_type().to_string(), handler);
    }

    pub fn get(&self, action_type: &str) -> Option<&dyn ActionHandler> {
        self.handlers.get(action_type).map(|b| b.as_ref())
    }

    /// Look up a handler, reporting a missing one as an error.
    pub fn require(&self, action_type: &str) -> ActionResult<&dyn ActionHandler> {
        self.get(action_type)
            .ok_or_else(|| ActionError::HandlerNotFound {
                action_type: action_type.to_string(),
            })
    }

    /// Registered action types, sorted.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// `(type, description)` pairs, sorted by type.
    pub fn describe(&self) -> Vec<(&str, &str)> {
        self.handlers
            .iter()
            .map(|(k, h)| (k.as_str(), h.description()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
