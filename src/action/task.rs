//! The plan-then-execute handler.
//!
//! A `task` action carries a free-text description. The handler asks the
//! reasoning oracle for a short plan over the registered primitive handlers
//! and runs each step in order. Steps run independently: one failing step
//! does not stop the rest, and the action succeeds only if all of them do.
//!
//! The oracle is never offered `task` itself, and a step of type `task` in
//! its answer is skipped, so a plan cannot expand into further plans.

use serde::Serialize;

use crate::oracle::{PlanRequest, PlanResponse, decode_plan};

use super::handler::{ActionHandler, ActionOutcome, HandlerContext};
use super::{ActionError, ActionItem, ActionResult, ActionStatus};

/// Action type served by [`TaskHandler`].
pub const TASK_ACTION: &str = "task";

/// Hard cap on plan length.
pub const MAX_PLAN_STEPS: usize = 3;

/// What happened to one plan step.
#[derive(Debug, Clone, Serialize)]
struct StepRecord {
    index: usize,
    action: String,
    description: String,
    skipped: bool,
    success: bool,
    summary: String,
}

pub struct TaskHandler;

impl ActionHandler for TaskHandler {
    fn action_type(&self) -> &str {
        TASK_ACTION
    }

    fn description(&self) -> &str {
        "Ask the reasoning oracle to plan a task, then run the plan. Params: description."
    }

    fn execute(&self, item: &ActionItem, ctx: &mut HandlerContext<'_>) -> ActionResult<ActionOutcome> {
        let description = item
            .param_str("description")
            .or(item.topic.as_deref())
            .ok_or(ActionError::MissingParam {
                action_type: TASK_ACTION.into(),
                param: "description",
            })?;

        let handlers = ctx.handlers;
        let oracle = ctx.oracle.ok_or_else(|| crate::oracle::OracleError::Unavailable {
            detail: "no oracle configured".into(),
        })?;

        let docs: Vec<(&str, &str)> = handlers
            .describe()
            .into_iter()
            .filter(|(ty, _)| *ty != TASK_ACTION)
            .collect();
        let request = PlanRequest {
            task_description: description.to_string(),
            allowed_action_types: docs.iter().map(|(ty, _)| ty.to_string()).collect(),
            max_steps: MAX_PLAN_STEPS,
        };

        let raw = oracle.request_plan(&request, &docs)?;
        // `task` is a known type so that a recursive step decodes and is
        // then skipped, rather than failing the whole plan.
        let known: Vec<&str> = handlers.types().collect();
        let steps = match decode_plan(&raw, &known, MAX_PLAN_STEPS)? {
            PlanResponse::NeedsHuman { reason } => {
                tracing::info!(action = %item.id, oracle = oracle.name(), %reason, "task needs a human");
                return Ok(ActionOutcome::needs_human(reason)
                    .with_detail(serde_json::json!({ "task": description })));
            }
            PlanResponse::Steps { steps } => steps,
        };

        let mut records = Vec::with_capacity(steps.len());
        for (index, step) in steps.into_iter().enumerate() {
            if step.action == TASK_ACTION {
                tracing::warn!(action = %item.id, step = index, "skipping recursive task step");
                records.push(StepRecord {
                    index,
                    action: step.action,
                    description: step.description,
                    skipped: true,
                    success: true,
                    summary: "skipped: task steps may not plan further tasks".into(),
                });
                continue;
            }

            let sub = ActionItem {
                id: format!("{}/step-{index}", item.id),
                action_type: step.action.clone(),
                params: step.params,
                status: ActionStatus::Executing,
                origin: Some(item.id.clone()),
                topic: Some(step.description.clone()),
                ..item.clone()
            };
            let result = handlers
                .require(&step.action)
                .and_then(|handler| handler.execute(&sub, ctx));
            let (success, summary) = match result {
                Ok(outcome) => (outcome.success, outcome.summary),
                Err(e) => (false, e.to_string()),
            };
            tracing::info!(action = %item.id, step = index, step_action = %step.action, success, "plan step finished");
            records.push(StepRecord {
                index,
                action: step.action,
                description: step.description,
                skipped: false,
                success,
                summary,
            });
        }

        let executed = records.iter().filter(|r| !r.skipped).count();
        let ok = records.iter().filter(|r| !r.skipped && r.success).count();
        let skipped = records.len() - executed;
        let summary = format!("plan: {ok}/{executed} steps ok, {skipped} skipped");
        let detail = serde_json::json!({ "task": description, "steps": records });
        let outcome = if ok == executed {
            ActionOutcome::ok(summary)
        } else {
            ActionOutcome::failed(summary)
        };
        Ok(outcome.with_detail(detail))
    }
}
