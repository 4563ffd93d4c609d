//! Trigger system: declared condition → action rules over observations.
//!
//! Each cycle the [`TriggerEngine`] walks its definitions in declaration
//! order. A definition fires at most once per cycle, on the first record that
//! matches its kinds and condition, and only when it is off cooldown. The
//! last firing time per trigger is persisted, so a restart does not reopen
//! a cooldown window.

pub mod condition;
pub mod cooldown;
pub mod engine;
pub mod template;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{NewAction, Params, Priority, TASK_ACTION};
use crate::clock::Millis;
use crate::observe::ObservationRecord;
use crate::pipeline::escape_literal;
use crate::process::shell_quote;
use crate::store::StoreError;

pub use condition::{Condition, ConditionError};
pub use cooldown::CooldownState;
pub use engine::{Evaluation, TriggerEngine};

/// Errors from loading trigger definitions.
#[derive(Debug, Error, Diagnostic)]
pub enum TriggerError {
    #[error("trigger id \"{id}\" is declared more than once")]
    #[diagnostic(
        code(tripwire::trigger::duplicate_id),
        help("Trigger ids key the persisted cooldowns and must be unique.")
    )]
    DuplicateId { id: String },

    #[error("trigger at position {index} has an empty id")]
    #[diagnostic(code(tripwire::trigger::empty_id))]
    EmptyId { index: usize },

    #[error("trigger \"{id}\" has an invalid condition: {source}")]
    #[diagnostic(code(tripwire::trigger::invalid_condition))]
    InvalidCondition {
        id: String,
        #[source]
        source: ConditionError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type TriggerResult<T> = std::result::Result<T, TriggerError>;

fn default_cooldown_secs() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

fn default_action_type() -> String {
    TASK_ACTION.to_string()
}

/// The action a trigger enqueues when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    #[serde(rename = "type", default = "default_action_type")]
    pub action_type: String,
    /// String values are rendered with the record's fields and `{topic}`.
    /// Placeholders in `command` expand to quoted shell words, so they must
    /// not sit inside quotes of their own.
    #[serde(default)]
    pub params: Params,
}

impl Default for ActionTemplate {
    fn default() -> Self {
        Self {
            action_type: default_action_type(),
            params: Params::new(),
        }
    }
}

/// A `[[triggers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Stable id; the cooldown key.
    pub id: String,
    /// Observation kinds inspected. Empty or `"*"` accepts any kind.
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub condition: Condition,
    /// Topic template, e.g. `"{symbol} moved {change_pct}%"`.
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub action: ActionTemplate,
}

impl TriggerDefinition {
    pub fn new(id: impl Into<String>, condition: Condition) -> Self {
        Self {
            id: id.into(),
            kinds: Vec::new(),
            condition,
            topic: String::new(),
            priority: Priority::default(),
            cooldown_secs: default_cooldown_secs(),
            enabled: true,
            action: ActionTemplate::default(),
        }
    }

    pub fn accepts_kind(&self, kind: &str) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| k == "*" || k == kind)
    }

    pub fn cooldown_ms(&self) -> Millis {
        self.cooldown_secs.saturating_mul(1000)
    }

    /// Render the topic for a matched record. An empty template falls back to
    /// `"<id> on <source>"`.
    pub fn render_topic(&self, record: &ObservationRecord) -> String {
        if self.topic.is_empty() {
            format!("{} on {}", self.id, record.source_id)
        } else {
            template::render(&self.topic, record, &[])
        }
    }
}

/// Observation values are untrusted. Values substituted into a `command`
/// become single shell words; values substituted into a `chain` cannot add
/// steps.
fn param_escape(param: &str) -> template::Escape {
    match param {
        "command" => shell_quote,
        "chain" => escape_literal,
        _ => str::to_string,
    }
}

/// A firing of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_id: String,
    pub topic: String,
    pub priority: Priority,
    pub observation: ObservationRecord,
    pub fired_at: Millis,
    pub action_type: String,
    #[serde(default)]
    pub params: Params,
}

impl TriggerEvent {
    /// Build the event for `definition` matching `record` at `now`.
    pub fn fire(definition: &TriggerDefinition, record: &ObservationRecord, now: Millis) -> Self {
        let topic = definition.render_topic(record);
        let extra = [("topic", topic.as_str())];
        let mut params: Params = definition
            .action
            .params
            .iter()
            .map(|(k, v)| {
                let rendered = template::render_value_escaped(v, record, &extra, param_escape(k));
                (k.clone(), rendered)
            })
            .collect();
        if definition.action.action_type == TASK_ACTION {
            params
                .entry("description".to_string())
                .or_insert_with(|| serde_json::Value::String(topic.clone()));
        }
        Self {
            trigger_id: definition.id.clone(),
            topic,
            priority: definition.priority,
            observation: record.clone(),
            fired_at: now,
            action_type: definition.action.action_type.clone(),
            params,
        }
    }

    /// The action item this event creates.
    pub fn to_action(&self) -> NewAction {
        NewAction {
            action_type: self.action_type.clone(),
            params: self.params.clone(),
            priority: self.priority,
            origin: Some(self.trigger_id.clone()),
            topic: Some(self.topic.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ObservationRecord {
        ObservationRecord::new(
            "market",
            "quote",
            crate::payload!("symbol" => "BTC", "change_pct" => 7.5),
            10,
        )
    }

    #[test]
    fn definition_from_toml_with_defaults() {
        let def: TriggerDefinition = toml::from_str(
            r#"
            id = "big-move"
            kinds = ["quote"]
            topic = "{symbol} moved {change_pct}%"
            priority = "high"
            condition = { op = "greater_than", field = "change_pct", value = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(def.cooldown_secs, 300);
        assert!(def.enabled);
        assert_eq!(def.action.action_type, "task");
        assert!(def.accepts_kind("quote"));
        assert!(!def.accepts_kind("mail"));
        assert_eq!(def.render_topic(&record()), "BTC moved 7.5%");
    }

    #[test]
    fn task_events_default_description_to_topic() {
        let mut def = TriggerDefinition::new("big-move", Condition::Always);
        def.topic = "{symbol} jumped".into();
        let event = TriggerEvent::fire(&def, &record(), 99);
        assert_eq!(event.params["description"], "BTC jumped");
        let action = event.to_action();
        assert_eq!(action.origin.as_deref(), Some("big-move"));
        assert_eq!(action.topic.as_deref(), Some("BTC jumped"));
    }

    #[test]
    fn action_params_are_rendered() {
        let mut def = TriggerDefinition::new("alert", Condition::Always);
        def.action = ActionTemplate {
            action_type: "notify".into(),
            params: [("message".to_string(), serde_json::json!("[{source}] {topic}"))].into(),
        };
        def.topic = "{symbol}".into();
        let event = TriggerEvent::fire(&def, &record(), 0);
        assert_eq!(event.params["message"], "[market] BTC");
        assert!(!event.params.contains_key("description"));
    }

    fn hostile_record() -> ObservationRecord {
        ObservationRecord::new(
            "inbox",
            "mail",
            crate::payload!("symbol" => "BTC -> wipe_all", "subject" => "hi; touch /tmp/owned"),
            0,
        )
    }

    #[test]
    fn payload_values_cannot_extend_a_chain() {
        let mut def = TriggerDefinition::new("report", Condition::Always);
        def.action = ActionTemplate {
            action_type: "pipeline".into(),
            params: [("chain".to_string(), serde_json::json!("report:{symbol} -> archive"))].into(),
        };
        let event = TriggerEvent::fire(&def, &hostile_record(), 0);
        let chain = event.params["chain"].as_str().unwrap();
        let ids: Vec<_> = crate::pipeline::parse_chain(chain)
            .into_iter()
            .map(|s| s.command_id)
            .collect();
        assert_eq!(ids, vec!["report", "archive"]);
    }

    #[test]
    fn payload_values_are_single_shell_words() {
        let mut def = TriggerDefinition::new("notify", Condition::Always);
        def.action = ActionTemplate {
            action_type: "shell".into(),
            params: [
                ("command".to_string(), serde_json::json!("notify-send {subject}")),
                ("note".to_string(), serde_json::json!("{subject}")),
            ]
            .into(),
        };
        let event = TriggerEvent::fire(&def, &hostile_record(), 0);
        assert_eq!(event.params["command"], "notify-send 'hi; touch /tmp/owned'");
        assert_eq!(event.params["note"], "hi; touch /tmp/owned");
    }

    #[test]
    fn empty_kinds_and_wildcard_accept_anything() {
        let mut def = TriggerDefinition::new("any", Condition::Always);
        assert!(def.accepts_kind("whatever"));
        def.kinds = vec!["*".into()];
        assert!(def.accepts_kind("whatever"));
    }
}
