//! The persisted action backlog.
//!
//! The whole backlog is rewritten to disk after every mutation. On open, any
//! item still marked `executing` was interrupted mid-run; it is failed rather
//! than retried because its handler may already have had side effects.

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::store::{JsonFile, StoreResult};

use super::{ActionError, ActionItem, ActionResult, ActionStatus, NewAction, Priority};

/// Default number of finished items kept in the backlog.
pub const DEFAULT_KEEP_FINISHED: usize = 100;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Backlog {
    next_seq: u64,
    items: Vec<ActionItem>,
}

pub struct ActionQueue {
    backlog: Backlog,
    file: Option<JsonFile>,
    clock: SharedClock,
    keep_finished: usize,
}

impl ActionQueue {
    /// A queue that is never persisted.
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            backlog: Backlog::default(),
            file: None,
            clock,
            keep_finished: DEFAULT_KEEP_FINISHED,
        }
    }

    /// Load the backlog from `file`, recovering interrupted items.
    pub fn open(file: JsonFile, clock: SharedClock, keep_finished: usize) -> StoreResult<Self> {
        let backlog: Backlog = file.load_or_default()?;
        let mut queue = Self {
            backlog,
            file: Some(file),
            clock,
            keep_finished,
        };
        let now = queue.clock.now_ms();
        let mut recovered = 0;
        for item in &mut queue.backlog.items {
            if item.status == ActionStatus::Executing {
                item.status = ActionStatus::Failed;
                item.completed_at = Some(now);
                item.error = Some("interrupted by restart".into());
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "failed actions interrupted by a previous shutdown");
            queue.persist()?;
        }
        Ok(queue)
    }

    /// Append a queued item and persist. On write failure the item is dropped.
    pub fn enqueue(&mut self, new: NewAction) -> ActionResult<ActionItem> {
        let now = self.clock.now_ms();
        let seq = self.backlog.next_seq;
        let item = ActionItem {
            id: format!("act-{now:x}-{seq:x}"),
            action_type: new.action_type,
            params: new.params,
            priority: new.priority,
            status: ActionStatus::Queued,
            created_at: now,
            seq,
            origin: new.origin,
            topic: new.topic,
            started_at: None,
            completed_at: None,
            error: None,
        };
        self.backlog.next_seq += 1;
        self.backlog.items.push(item.clone());
        if let Err(e) = self.persist() {
            self.backlog.items.pop();
            self.backlog.next_seq -= 1;
            return Err(e.into());
        }
        tracing::info!(
            action = %item.id,
            action_type = %item.action_type,
            priority = %item.priority,
            "action queued",
        );
        Ok(item)
    }

    /// The next item to dispatch, optionally restricted to `min` or more urgent.
    pub fn next_ready(&self, min: Option<Priority>) -> Option<&ActionItem> {
        self.backlog
            .items
            .iter()
            .filter(|i| i.status == ActionStatus::Queued)
            .filter(|i| min.is_none_or(|m| i.priority.is_at_least(m)))
            .min_by_key(|i| i.dispatch_key())
    }

    /// Queued items in dispatch order.
    pub fn queued(&self) -> Vec<&ActionItem> {
        let mut items: Vec<_> = self
            .backlog
            .items
            .iter()
            .filter(|i| i.status == ActionStatus::Queued)
            .collect();
        items.sort_by_key(|i| i.dispatch_key());
        items
    }

    pub fn items(&self) -> &[ActionItem] {
        &self.backlog.items
    }

    pub fn get(&self, id: &str) -> Option<&ActionItem> {
        self.backlog.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.backlog.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.items.is_empty()
    }

    /// `queued → executing`.
    pub fn mark_executing(&mut self, id: &str) -> ActionResult<ActionItem> {
        let now = self.clock.now_ms();
        let item = self.find_mut(id)?;
        item.status = ActionStatus::Executing;
        item.started_at = Some(now);
        let snapshot = item.clone();
        self.persist_or_warn();
        Ok(snapshot)
    }

    /// `executing → succeeded | failed`.
    pub fn complete(&mut self, id: &str, success: bool, error: Option<String>) -> ActionResult<ActionItem> {
        let now = self.clock.now_ms();
        let item = self.find_mut(id)?;
        item.status = if success {
            ActionStatus::Succeeded
        } else {
            ActionStatus::Failed
        };
        item.completed_at = Some(now);
        item.error = error;
        let snapshot = item.clone();
        self.prune();
        self.persist_or_warn();
        Ok(snapshot)
    }

    fn find_mut(&mut self, id: &str) -> ActionResult<&mut ActionItem> {
        self.backlog
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| ActionError::NotFound { id: id.to_string() })
    }

    /// Drop the oldest finished items beyond `keep_finished`.
    fn prune(&mut self) {
        let finished = self
            .backlog
            .items
            .iter()
            .filter(|i| i.status.is_terminal())
            .count();
        let mut excess = finished.saturating_sub(self.keep_finished);
        if excess == 0 {
            return;
        }
        // Items are stored in enqueue order, so the first finished ones are the oldest.
        self.backlog.items.retain(|i| {
            if excess > 0 && i.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn persist(&self) -> StoreResult<()> {
        match &self.file {
            Some(file) => file.save(&self.backlog),
            None => Ok(()),
        }
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist action backlog");
        }
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("items", &self.backlog.items.len())
            .field("persisted", &self.file.is_some())
            .finish()
    }
}
