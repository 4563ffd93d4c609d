//! Cooldown-aware trigger evaluation.

use std::collections::{HashMap, HashSet};

use crate::clock::{Millis, SharedClock};
use crate::observe::ObservationRecord;
use crate::store::{BoundedLog, JsonFile};

use super::condition::ConditionError;
use super::cooldown::CooldownState;
use super::{TriggerDefinition, TriggerError, TriggerEvent, TriggerResult};

/// Result of one evaluation pass.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Fired events, in declaration order of their triggers.
    pub events: Vec<TriggerEvent>,
    /// Condition errors, treated as non-matches.
    pub condition_errors: Vec<(String, ConditionError)>,
    /// Triggers whose condition matched while still on cooldown.
    pub suppressed: Vec<String>,
}

pub struct TriggerEngine {
    definitions: Vec<TriggerDefinition>,
    cooldowns: CooldownState,
    cooldown_file: Option<JsonFile>,
    /// Timestamps overwritten by the last evaluation, for [`TriggerEngine::release`].
    previous: HashMap<String, Option<Millis>>,
    history: BoundedLog<TriggerEvent>,
    clock: SharedClock,
}

impl TriggerEngine {
    /// An engine whose cooldowns live only in memory.
    pub fn new(definitions: Vec<TriggerDefinition>, clock: SharedClock) -> TriggerResult<Self> {
        validate(&definitions)?;
        Ok(Self {
            definitions,
            cooldowns: CooldownState::default(),
            cooldown_file: None,
            previous: HashMap::new(),
            history: BoundedLog::in_memory(100),
            clock,
        })
    }

    /// An engine that loads and persists cooldowns in `cooldown_file`.
    pub fn open(
        definitions: Vec<TriggerDefinition>,
        cooldown_file: JsonFile,
        history: BoundedLog<TriggerEvent>,
        clock: SharedClock,
    ) -> TriggerResult<Self> {
        validate(&definitions)?;
        let cooldowns: CooldownState = cooldown_file.load_or_default()?;
        Ok(Self {
            definitions,
            cooldowns,
            cooldown_file: Some(cooldown_file),
            previous: HashMap::new(),
            history,
            clock,
        })
    }

    /// Evaluate a batch. Fired triggers have their cooldown set to now.
    pub fn evaluate(&mut self, records: &[ObservationRecord]) -> Evaluation {
        let now = self.clock.now_ms();
        let mut eval = Evaluation::default();
        self.previous.clear();

        for def in self.definitions.iter().filter(|d| d.enabled) {
            for record in records.iter().filter(|r| def.accepts_kind(&r.kind)) {
                match def.condition.evaluate(record) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!(trigger_id = %def.id, source = %record.source_id, error = %e, "condition error");
                        eval.condition_errors.push((def.id.clone(), e));
                        continue;
                    }
                }
                if self.cooldowns.is_ready(&def.id, def.cooldown_ms(), now) {
                    let event = TriggerEvent::fire(def, record, now);
                    tracing::info!(trigger_id = %def.id, priority = %def.priority, topic = %event.topic, "trigger fired");
                    self.previous
                        .insert(def.id.clone(), self.cooldowns.last_fired(&def.id));
                    self.cooldowns.record(&def.id, now);
                    eval.events.push(event);
                } else {
                    tracing::debug!(trigger_id = %def.id, "trigger on cooldown");
                    eval.suppressed.push(def.id.clone());
                }
                // First matching record decides this definition's cycle.
                break;
            }
        }

        if !eval.events.is_empty() {
            self.persist_cooldowns();
            for event in &eval.events {
                self.history.append(event.clone());
            }
        }
        eval
    }

    /// Undo the cooldown an event from the last evaluation set, so the
    /// trigger can fire again once its action is actually queued.
    pub fn release(&mut self, event: &TriggerEvent) -> bool {
        if self.cooldowns.last_fired(&event.trigger_id) != Some(event.fired_at) {
            return false;
        }
        let Some(previous) = self.previous.remove(&event.trigger_id) else {
            return false;
        };
        self.cooldowns.restore(&event.trigger_id, previous);
        self.persist_cooldowns();
        tracing::debug!(trigger_id = %event.trigger_id, "cooldown released");
        true
    }

    pub fn definitions(&self) -> &[TriggerDefinition] {
        &self.definitions
    }

    pub fn cooldowns(&self) -> &CooldownState {
        &self.cooldowns
    }

    pub fn history(&self) -> &BoundedLog<TriggerEvent> {
        &self.history
    }

    /// Clear one trigger's cooldown, or all of them, and persist.
    pub fn reset_cooldown(&mut self, trigger_id: Option<&str>) -> bool {
        let changed = match trigger_id {
            Some(id) => self.cooldowns.reset(id),
            None => {
                let had_any = !self.cooldowns.is_empty();
                self.cooldowns.clear();
                had_any
            }
        };
        if changed {
            self.persist_cooldowns();
        }
        changed
    }

    fn persist_cooldowns(&self) {
        if let Some(file) = &self.cooldown_file {
            if let Err(e) = file.save(&self.cooldowns) {
                tracing::warn!(error = %e, "failed to persist trigger cooldowns");
            }
        }
    }
}

fn validate(definitions: &[TriggerDefinition]) -> TriggerResult<()> {
    let mut seen = HashSet::new();
    for (index, def) in definitions.iter().enumerate() {
        if def.id.trim().is_empty() {
            return Err(TriggerError::EmptyId { index });
        }
        if !seen.insert(def.id.as_str()) {
            return Err(TriggerError::DuplicateId { id: def.id.clone() });
        }
        def.condition
            .validate()
            .map_err(|source| TriggerError::InvalidCondition {
                id: def.id.clone(),
                source,
            })?;
    }
    Ok(())
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("definitions", &self.definitions.len())
            .field("cooldowns", &self.cooldowns)
            .field("persisted", &self.cooldown_file.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::payload;
    use crate::trigger::Condition;

    fn quote(symbol: &str, change: f64) -> ObservationRecord {
        ObservationRecord::new(
            "market",
            "quote",
            payload!("symbol" => symbol, "change_pct" => change),
            0,
        )
    }

    fn big_move(cooldown_secs: u64) -> TriggerDefinition {
        let mut def = TriggerDefinition::new(
            "big-move",
            Condition::GreaterThan {
                field: "change_pct".into(),
                value: 5.0,
            },
        );
        def.kinds = vec!["quote".into()];
        def.topic = "{symbol} moved".into();
        def.cooldown_secs = cooldown_secs;
        def
    }

    #[test]
    fn fires_once_per_cycle_on_first_match() {
        let clock = ManualClock::new(0);
        let mut engine = TriggerEngine::new(vec![big_move(60)], Arc::new(clock)).unwrap();
        let eval = engine.evaluate(&[quote("DOGE", 1.0), quote("BTC", 9.0), quote("ETH", 8.0)]);
        assert_eq!(eval.events.len(), 1);
        assert_eq!(eval.events[0].topic, "BTC moved");
    }

    #[test]
    fn cooldown_window_is_honoured() {
        let clock = ManualClock::new(1_000);
        let mut engine = TriggerEngine::new(vec![big_move(60)], Arc::new(clock.clone())).unwrap();
        assert_eq!(engine.evaluate(&[quote("BTC", 9.0)]).events.len(), 1);

        clock.advance(Duration::from_secs(59));
        let eval = engine.evaluate(&[quote("BTC", 9.0)]);
        assert!(eval.events.is_empty());
        assert_eq!(eval.suppressed, vec!["big-move"]);

        clock.advance(Duration::from_secs(1));
        assert_eq!(engine.evaluate(&[quote("BTC", 9.0)]).events.len(), 1);
    }

    #[test]
    fn clock_stepping_back_does_not_reopen_the_window() {
        let clock = ManualClock::new(1_000_000);
        let mut engine = TriggerEngine::new(vec![big_move(600)], Arc::new(clock.clone())).unwrap();
        assert_eq!(engine.evaluate(&[quote("BTC", 9.0)]).events.len(), 1);

        clock.set(999_000);
        let eval = engine.evaluate(&[quote("BTC", 9.0)]);
        assert!(eval.events.is_empty());
        assert_eq!(eval.suppressed, vec!["big-move"]);
    }

    #[test]
    fn release_restores_the_previous_cooldown() {
        let clock = ManualClock::new(1_000);
        let mut engine = TriggerEngine::new(vec![big_move(60)], Arc::new(clock.clone())).unwrap();
        let first = engine.evaluate(&[quote("BTC", 9.0)]).events.remove(0);

        clock.advance(Duration::from_secs(60));
        let second = engine.evaluate(&[quote("BTC", 9.0)]).events.remove(0);
        assert!(engine.release(&second));
        assert_eq!(engine.cooldowns().last_fired("big-move"), Some(first.fired_at));
        // Only the most recent evaluation can be released.
        assert!(!engine.release(&first));
        assert!(!engine.release(&second));
    }

    #[test]
    fn events_follow_declaration_order() {
        let mut any_quote = TriggerDefinition::new("any-quote", Condition::Always);
        any_quote.kinds = vec!["quote".into()];
        let defs = vec![big_move(0), any_quote];
        let mut engine = TriggerEngine::new(defs, Arc::new(ManualClock::new(0))).unwrap();
        let ids: Vec<_> = engine
            .evaluate(&[quote("BTC", 9.0)])
            .events
            .into_iter()
            .map(|e| e.trigger_id)
            .collect();
        assert_eq!(ids, vec!["big-move", "any-quote"]);
    }

    #[test]
    fn condition_errors_are_non_matches() {
        let bad = ObservationRecord::new("market", "quote", payload!("change_pct" => "lots"), 0);
        let mut engine = TriggerEngine::new(vec![big_move(0)], Arc::new(ManualClock::new(0))).unwrap();
        let eval = engine.evaluate(&[bad, quote("BTC", 9.0)]);
        assert_eq!(eval.condition_errors.len(), 1);
        assert_eq!(eval.events.len(), 1);
    }

    #[test]
    fn disabled_and_other_kinds_are_ignored() {
        let mut def = big_move(0);
        let mail = ObservationRecord::new("inbox", "mail", payload!("change_pct" => 50), 0);
        let mut engine = TriggerEngine::new(vec![def.clone()], Arc::new(ManualClock::new(0))).unwrap();
        assert!(engine.evaluate(&[mail]).events.is_empty());

        def.enabled = false;
        let mut engine = TriggerEngine::new(vec![def], Arc::new(ManualClock::new(0))).unwrap();
        assert!(engine.evaluate(&[quote("BTC", 9.0)]).events.is_empty());
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        assert!(matches!(
            TriggerEngine::new(vec![big_move(1), big_move(2)], clock.clone()),
            Err(TriggerError::DuplicateId { .. })
        ));
        let bad = TriggerDefinition::new(
            "bad-regex",
            Condition::Matches {
                field: "symbol".into(),
                pattern: "(".into(),
            },
        );
        assert!(matches!(
            TriggerEngine::new(vec![bad], clock),
            Err(TriggerError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn cooldowns_persist_and_reset() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = JsonFile::new(dir.path().join("cooldowns.json"));
        let clock = ManualClock::new(10_000);
        {
            let mut engine = TriggerEngine::open(
                vec![big_move(300)],
                file.clone(),
                BoundedLog::in_memory(10),
                Arc::new(clock.clone()),
            )
            .unwrap();
            assert_eq!(engine.evaluate(&[quote("BTC", 9.0)]).events.len(), 1);
        }
        clock.advance(Duration::from_secs(10));
        let mut engine = TriggerEngine::open(
            vec![big_move(300)],
            file,
            BoundedLog::in_memory(10),
            Arc::new(clock),
        )
        .unwrap();
        assert_eq!(engine.cooldowns().last_fired("big-move"), Some(10_000));
        assert!(engine.evaluate(&[quote("BTC", 9.0)]).events.is_empty());
        assert!(engine.reset_cooldown(Some("big-move")));
        assert_eq!(engine.evaluate(&[quote("BTC", 9.0)]).events.len(), 1);
    }
}
