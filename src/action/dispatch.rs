//! The dispatcher: pops items in priority-then-FIFO order and runs their
//! handlers, one at a time.
//!
//! Every outcome, including a missing handler or a handler error, ends up as
//! a terminal status on the item and an entry in the action log. Nothing a
//! handler does can abort the loop.

use serde::{Deserialize, Serialize};

use crate::clock::{Millis, SharedClock};
use crate::oracle::ReasoningOracle;
use crate::pipeline::Pipeline;
use crate::store::BoundedLog;

use super::handler::{HandlerContext, HandlerRegistry};
use super::queue::ActionQueue;
use super::{ActionError, ActionItem, ActionResult, ActionStatus, NewAction, Priority};

/// One finished dispatch, as written to the action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub action_id: String,
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub priority: Priority,
    pub success: bool,
    #[serde(default)]
    pub needs_human: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub started_at: Millis,
    pub completed_at: Millis,
}

pub struct Dispatcher {
    queue: ActionQueue,
    handlers: HandlerRegistry,
    pipeline: Pipeline,
    oracle: Option<Box<dyn ReasoningOracle>>,
    log: BoundedLog<ActionLogEntry>,
    clock: SharedClock,
}

impl Dispatcher {
    pub fn new(
        queue: ActionQueue,
        handlers: HandlerRegistry,
        pipeline: Pipeline,
        oracle: Option<Box<dyn ReasoningOracle>>,
        log: BoundedLog<ActionLogEntry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            queue,
            handlers,
            pipeline,
            oracle,
            log,
            clock,
        }
    }

    pub fn enqueue(&mut self, new: NewAction) -> ActionResult<ActionItem> {
        self.queue.enqueue(new)
    }

    /// Run the next ready item at or above `min`, if any.
    pub fn dispatch_next(&mut self, min: Option<Priority>) -> ActionResult<Option<ActionLogEntry>> {
        let Some(id) = self.queue.next_ready(min).map(|i| i.id.clone()) else {
            return Ok(None);
        };
        self.execute(&id).map(Some)
    }

    /// Run one specific queued item, out of order.
    pub fn dispatch(&mut self, id: &str) -> ActionResult<ActionLogEntry> {
        let item = self
            .queue
            .get(id)
            .ok_or_else(|| ActionError::NotFound { id: id.to_string() })?;
        if item.status != ActionStatus::Queued {
            return Err(ActionError::Execution {
                action_type: item.action_type.clone(),
                message: format!("action {id} is not queued ({:?})", item.status),
            });
        }
        self.execute(id)
    }

    /// Dispatch ready items until the queue is empty or `max` have run.
    pub fn drain(&mut self, min: Option<Priority>, max: usize) -> ActionResult<Vec<ActionLogEntry>> {
        let mut done = Vec::new();
        while done.len() < max {
            match self.dispatch_next(min)? {
                Some(entry) => done.push(entry),
                None => break,
            }
        }
        Ok(done)
    }

    fn execute(&mut self, id: &str) -> ActionResult<ActionLogEntry> {
        let item = self.queue.mark_executing(id)?;
        let started_at = item.started_at.unwrap_or_else(|| self.clock.now_ms());
        let span = tracing::info_span!("dispatch", action = %item.id, action_type = %item.action_type);
        let _enter = span.enter();

        let result = match self.handlers.require(&item.action_type) {
            Ok(handler) => {
                let mut ctx = HandlerContext {
                    pipeline: &mut self.pipeline,
                    oracle: self.oracle.as_deref(),
                    handlers: &self.handlers,
                };
                handler.execute(&item, &mut ctx)
            }
            Err(e) => Err(e),
        };

        let (success, needs_human, summary, error, detail) = match result {
            Ok(outcome) => {
                let error = (!outcome.success).then(|| outcome.summary.clone());
                (
                    outcome.success,
                    outcome.needs_human,
                    outcome.summary,
                    error,
                    outcome.detail,
                )
            }
            Err(e) => {
                let message = e.to_string();
                (false, false, message.clone(), Some(message), serde_json::Value::Null)
            }
        };

        let finished = self.queue.complete(id, success, error.clone())?;
        if success {
            tracing::info!(needs_human, "{summary}");
        } else {
            tracing::warn!(error = error.as_deref().unwrap_or(""), "action failed");
        }

        let entry = ActionLogEntry {
            action_id: finished.id,
            action_type: finished.action_type,
            origin: finished.origin,
            priority: finished.priority,
            success,
            needs_human,
            summary,
            error,
            detail,
            started_at,
            completed_at: finished.completed_at.unwrap_or(started_at),
        };
        self.log.append(entry.clone());
        Ok(entry)
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn log(&self) -> &BoundedLog<ActionLogEntry> {
        &self.log
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers)
            .field("oracle", &self.oracle.as_ref().map(|o| o.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::CommandRegistry;

    fn dispatcher() -> Dispatcher {
        let clock: SharedClock = Arc::new(ManualClock::new(1_000));
        let registry = CommandRegistry::from_entries([
            ("text", "hello", "echo hello"),
            ("text", "upper", "printf '%s' \"$TRIPWIRE_INPUT\" | tr a-z A-Z"),
        ])
        .unwrap();
        Dispatcher::new(
            ActionQueue::in_memory(clock.clone()),
            HandlerRegistry::with_builtins(),
            Pipeline::new(registry, BoundedLog::in_memory(10), clock.clone(), Duration::from_secs(5)),
            None,
            BoundedLog::in_memory(10),
            clock,
        )
    }

    #[test]
    fn runs_in_priority_order_and_logs() {
        let mut d = dispatcher();
        d.enqueue(NewAction::new("notify", Priority::Low).with_param("message", "low"))
            .unwrap();
        d.enqueue(NewAction::new("notify", Priority::Critical).with_param("message", "crit"))
            .unwrap();
        let done = d.drain(None, 10).unwrap();
        let summaries: Vec<_> = done.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(summaries, vec!["crit", "low"]);
        assert_eq!(d.log().len(), 2);
        assert!(d.queue().queued().is_empty());
    }

    #[test]
    fn threshold_and_limit_are_respected() {
        let mut d = dispatcher();
        for _ in 0..3 {
            d.enqueue(NewAction::new("notify", Priority::High).with_param("message", "m"))
                .unwrap();
        }
        d.enqueue(NewAction::new("notify", Priority::Low).with_param("message", "m"))
            .unwrap();
        assert_eq!(d.drain(Some(Priority::High), 2).unwrap().len(), 2);
        assert_eq!(d.drain(Some(Priority::High), 10).unwrap().len(), 1);
        assert_eq!(d.queue().queued().len(), 1);
    }

    #[test]
    fn missing_handler_fails_the_item() {
        let mut d = dispatcher();
        let item = d.enqueue(NewAction::new("teleport", Priority::High)).unwrap();
        let entry = d.dispatch_next(None).unwrap().unwrap();
        assert!(!entry.success);
        assert!(entry.error.unwrap().contains("no handler for action type \"teleport\""));
        assert_eq!(d.queue().get(&item.id).unwrap().status, ActionStatus::Failed);
    }

    #[test]
    fn pipeline_action_threads_output() {
        let mut d = dispatcher();
        d.enqueue(NewAction::new("pipeline", Priority::Medium).with_param("chain", "hello -> upper"))
            .unwrap();
        let entry = d.dispatch_next(None).unwrap().unwrap();
        assert!(entry.success, "{entry:?}");
        assert_eq!(entry.detail["final_output"], "HELLO");
        assert_eq!(d.pipeline().log().len(), 1);
    }

    #[test]
    fn task_without_oracle_fails_cleanly() {
        let mut d = dispatcher();
        d.enqueue(NewAction::new("task", Priority::High).with_topic("plan something"))
            .unwrap();
        let entry = d.dispatch_next(None).unwrap().unwrap();
        assert!(!entry.success);
        assert!(entry.error.unwrap().contains("not available"));
    }

    #[test]
    fn dispatching_a_finished_item_is_rejected() {
        let mut d = dispatcher();
        let item = d
            .enqueue(NewAction::new("notify", Priority::Low).with_param("message", "x"))
            .unwrap();
        d.dispatch(&item.id).unwrap();
        assert!(d.dispatch(&item.id).is_err());
        assert!(matches!(d.dispatch("act-missing"), Err(ActionError::NotFound { .. })));
    }
}
