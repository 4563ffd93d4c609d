//! Last-fired timestamps per trigger id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Millis;

/// Map from trigger id to the time it last fired.
///
/// Losing this state fails open: triggers may refire early.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CooldownState {
    last_fired: BTreeMap<String, Millis>,
}

impl CooldownState {
    /// Whether `trigger_id` may fire at `now` given its cooldown.
    ///
    /// A timestamp in the future (clock moved backwards) is not ready: the
    /// window only closes once `now - last >= cooldown` holds.
    pub fn is_ready(&self, trigger_id: &str, cooldown_ms: Millis, now: Millis) -> bool {
        match self.last_fired.get(trigger_id) {
            None => true,
            Some(&last) => now >= last && now - last >= cooldown_ms,
        }
    }

    /// Remaining cooldown at `now`, or zero when ready.
    pub fn remaining(&self, trigger_id: &str, cooldown_ms: Millis, now: Millis) -> Millis {
        match self.last_fired.get(trigger_id) {
            Some(&last) => last.saturating_add(cooldown_ms).saturating_sub(now),
            None => 0,
        }
    }

    pub fn record(&mut self, trigger_id: &str, now: Millis) {
        self.last_fired.insert(trigger_id.to_string(), now);
    }

    /// Put back a previous timestamp, or forget the trigger when `None`.
    pub fn restore(&mut self, trigger_id: &str, previous: Option<Millis>) {
        match previous {
            Some(at) => self.record(trigger_id, at),
            None => {
                self.last_fired.remove(trigger_id);
            }
        }
    }

    pub fn last_fired(&self, trigger_id: &str) -> Option<Millis> {
        self.last_fired.get(trigger_id).copied()
    }

    /// Forget one trigger's timestamp. Returns whether it was present.
    pub fn reset(&mut self, trigger_id: &str) -> bool {
        self.last_fired.remove(trigger_id).is_some()
    }

    pub fn clear(&mut self) {
        self.last_fired.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Millis)> {
        self.last_fired.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}
