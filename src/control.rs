//! The serialized control loop: observations → triggers → queue → dispatch.
//!
//! One [`ControlLoop::run_cycle`] evaluates a batch, enqueues one action per
//! fired trigger, then drains queued items at or above the auto-dispatch
//! tier. Cycles never overlap, which keeps the cooldown map and the backlog
//! single-writer.

use std::sync::Arc;

use serde::Serialize;

use crate::action::{ActionLogEntry, ActionQueue, Dispatcher, HandlerRegistry, Priority};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::TripwireResult;
use crate::observe::{Collector, CommandSource, ObservationRecord};
use crate::oracle::{OllamaOracle, ReasoningOracle};
use crate::paths::TripwirePaths;
use crate::pipeline::{CommandRegistry, Pipeline};
use crate::store::{BoundedLog, JsonFile};
use crate::trigger::TriggerEngine;

/// What one cycle did.
#[derive(Debug, Default, Serialize)]
pub struct CycleReport {
    pub observations: usize,
    /// Trigger ids that fired, in declaration order.
    pub fired: Vec<String>,
    /// Action ids created from fired triggers.
    pub enqueued: Vec<String>,
    /// Triggers that matched while on cooldown.
    pub suppressed: Vec<String>,
    pub condition_errors: usize,
    /// Fired triggers whose action could not be persisted.
    pub enqueue_failures: usize,
    pub dispatched: Vec<ActionLogEntry>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.fired.is_empty() && self.dispatched.is_empty()
    }
}

pub struct ControlLoop {
    collector: Collector,
    triggers: TriggerEngine,
    dispatcher: Dispatcher,
    auto_dispatch: Option<Priority>,
    max_per_cycle: usize,
}

impl ControlLoop {
    pub fn new(
        collector: Collector,
        triggers: TriggerEngine,
        dispatcher: Dispatcher,
        auto_dispatch: Option<Priority>,
        max_per_cycle: usize,
    ) -> Self {
        Self {
            collector,
            triggers,
            dispatcher,
            auto_dispatch,
            max_per_cycle: max_per_cycle.max(1),
        }
    }

    /// Build the loop from config, with all state persisted under `paths`.
    pub fn open(config: &Config, paths: &TripwirePaths, clock: SharedClock) -> TripwireResult<Self> {
        paths.ensure_dirs()?;

        let mut collector = Collector::new(clock.clone());
        for source in &config.sources {
            collector.add_source(
                Arc::new(CommandSource::new(
                    &source.id,
                    &source.kind,
                    &source.command,
                    source.timeout(),
                )),
                source.interval(),
            );
        }

        let triggers = TriggerEngine::open(
            config.triggers.clone(),
            JsonFile::new(paths.cooldowns_file()),
            BoundedLog::open(JsonFile::new(paths.trigger_log_file()), config.history.triggers)?,
            clock.clone(),
        )?;

        let dispatcher = open_dispatcher(config, paths, clock)?;
        tracing::info!(
            sources = config.sources.len(),
            triggers = config.triggers.len(),
            queued = dispatcher.queue().queued().len(),
            "control loop ready",
        );

        Ok(Self::new(
            collector,
            triggers,
            dispatcher,
            config.dispatch.auto_dispatch.threshold(),
            config.dispatch.max_per_cycle,
        ))
    }

    /// Evaluate a batch, enqueue fired actions, then auto-dispatch.
    pub fn run_cycle(&mut self, batch: Vec<ObservationRecord>) -> CycleReport {
        let mut report = CycleReport {
            observations: batch.len(),
            ..CycleReport::default()
        };

        let evaluation = self.triggers.evaluate(&batch);
        report.condition_errors = evaluation.condition_errors.len();
        report.suppressed = evaluation.suppressed;

        for event in evaluation.events {
            report.fired.push(event.trigger_id.clone());
            match self.dispatcher.enqueue(event.to_action()) {
                Ok(item) => report.enqueued.push(item.id),
                Err(e) => {
                    tracing::warn!(trigger_id = %event.trigger_id, error = %e, "failed to enqueue action");
                    self.triggers.release(&event);
                    report.enqueue_failures += 1;
                }
            }
        }

        report.dispatched = self.dispatch_pending();
        report
    }

    /// Drain queued items at or above the auto-dispatch tier.
    pub fn dispatch_pending(&mut self) -> Vec<ActionLogEntry> {
        let Some(threshold) = self.auto_dispatch else {
            return Vec::new();
        };
        match self.dispatcher.drain(Some(threshold), self.max_per_cycle) {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "dispatch stopped early");
                Vec::new()
            }
        }
    }

    /// Sample every source once and run a cycle.
    pub fn run_once(&mut self) -> CycleReport {
        let batch = self.collector.collect_all();
        self.run_cycle(batch)
    }

    /// Sample only the sources that are due and run a cycle.
    pub fn tick(&mut self) -> CycleReport {
        let batch = self.collector.collect_due();
        self.run_cycle(batch)
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn triggers(&self) -> &TriggerEngine {
        &self.triggers
    }

    pub fn triggers_mut(&mut self) -> &mut TriggerEngine {
        &mut self.triggers
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn auto_dispatch(&self) -> Option<Priority> {
        self.auto_dispatch
    }
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("collector", &self.collector)
            .field("triggers", &self.triggers)
            .field("dispatcher", &self.dispatcher)
            .field("auto_dispatch", &self.auto_dispatch)
            .finish()
    }
}

/// Load the command registry named by the config.
///
/// A missing or unparsable registry file is an error: pipelines cannot run
/// without one.
pub fn load_registry(config: &Config, paths: &TripwirePaths) -> TripwireResult<CommandRegistry> {
    let path = config.registry_path(&paths.config_dir);
    let registry = CommandRegistry::load(&path)?;
    tracing::debug!(path = %path.display(), commands = registry.len(), "command registry loaded");
    Ok(registry)
}

/// The pipeline interpreter with its persisted execution log.
pub fn open_pipeline(config: &Config, paths: &TripwirePaths, clock: SharedClock) -> TripwireResult<Pipeline> {
    let registry = load_registry(config, paths)?;
    let log = BoundedLog::open(JsonFile::new(paths.pipeline_log_file()), config.history.pipelines)?;
    Ok(Pipeline::new(registry, log, clock, config.pipeline.step_timeout()))
}

/// The dispatcher with its persisted backlog and action log.
pub fn open_dispatcher(config: &Config, paths: &TripwirePaths, clock: SharedClock) -> TripwireResult<Dispatcher> {
    let pipeline = open_pipeline(config, paths, clock.clone())?;
    let queue = ActionQueue::open(
        JsonFile::new(paths.backlog_file()),
        clock.clone(),
        config.dispatch.keep_finished,
    )?;
    let log = BoundedLog::open(JsonFile::new(paths.action_log_file()), config.history.actions)?;
    let oracle: Option<Box<dyn ReasoningOracle>> = config
        .oracle
        .enabled
        .then(|| Box::new(OllamaOracle::new(config.oracle.clone())) as Box<dyn ReasoningOracle>);
    Ok(Dispatcher::new(
        queue,
        HandlerRegistry::with_builtins(),
        pipeline,
        oracle,
        log,
        clock,
    ))
}
