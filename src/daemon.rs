//! Long-running scheduler for the control loop.
//!
//! Each observation source gets its own tokio interval task. Collection runs
//! on the blocking pool under a timeout, so a hung source only delays its own
//! next tick. Batches flow over a channel into one select loop that owns the
//! [`ControlLoop`], so trigger evaluation and dispatch stay serialized. The
//! loop itself stays synchronous; tokio only drives scheduling and signals.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::clock::SharedClock;
use crate::control::{ControlLoop, CycleReport};
use crate::observe::{ObservationRecord, collect_source};

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// How often queued items are re-checked for dispatch (default: 30s).
    pub dispatch_interval: Duration,
    /// Upper bound on one source collection (default: 120s).
    pub collect_timeout: Duration,
    /// Stop after this many cycles (0 = unlimited).
    pub max_cycles: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(30),
            collect_timeout: Duration::from_secs(120),
            max_cycles: 0,
        }
    }
}

pub struct LoopDaemon {
    control: ControlLoop,
    config: DaemonConfig,
    clock: SharedClock,
    cycles: usize,
}

impl LoopDaemon {
    pub fn new(control: ControlLoop, config: DaemonConfig, clock: SharedClock) -> Self {
        Self {
            control,
            config,
            clock,
            cycles: 0,
        }
    }

    /// Run until Ctrl-C or `max_cycles`.
    ///
    /// Must be called on a multi-threaded runtime: cycles run through
    /// `block_in_place`.
    pub async fn run(&mut self) {
        let (tx, mut rx) = mpsc::channel::<Vec<ObservationRecord>>(64);
        let collectors = self.spawn_collectors(tx);

        let mut dispatch_tick = interval(self.config.dispatch_interval);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(sources = collectors.len(), "daemon started");

        loop {
            tokio::select! {
                Some(batch) = rx.recv() => {
                    let control = &mut self.control;
                    let report = tokio::task::block_in_place(|| control.run_cycle(batch));
                    self.cycles += 1;
                    log_report(&report);
                    if self.config.max_cycles > 0 && self.cycles >= self.config.max_cycles {
                        tracing::info!(max_cycles = self.config.max_cycles, "daemon: max cycles reached, shutting down");
                        break;
                    }
                }
                _ = dispatch_tick.tick() => {
                    let control = &mut self.control;
                    let done = tokio::task::block_in_place(|| control.dispatch_pending());
                    if !done.is_empty() {
                        tracing::info!(dispatched = done.len(), "daemon: dispatched queued actions");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("daemon: received shutdown signal");
                    break;
                }
            }
        }

        for handle in collectors {
            handle.abort();
        }
        tracing::info!(cycles = self.cycles, "daemon stopped");
    }

    fn spawn_collectors(&self, tx: mpsc::Sender<Vec<ObservationRecord>>) -> Vec<JoinHandle<()>> {
        self.control
            .collector()
            .sources()
            .iter()
            .map(|scheduled| {
                let source = scheduled.source.clone();
                let period = scheduled.interval;
                let timeout = self.config.collect_timeout;
                let clock = self.clock.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut tick = interval(period);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tick.tick().await;
                        let src = source.clone();
                        let now = clock.now_ms();
                        let job = tokio::task::spawn_blocking(move || collect_source(src.as_ref(), now));
                        let records = match tokio::time::timeout(timeout, job).await {
                            Ok(Ok(records)) => records,
                            Ok(Err(e)) => {
                                tracing::warn!(source = source.id(), error = %e, "collection task failed");
                                continue;
                            }
                            Err(_) => {
                                tracing::warn!(source = source.id(), timeout_secs = timeout.as_secs(), "collection timed out");
                                continue;
                            }
                        };
                        if records.is_empty() {
                            continue;
                        }
                        if tx.send(records).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect()
    }

    pub fn control(&self) -> &ControlLoop {
        &self.control
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }
}

fn log_report(report: &CycleReport) {
    if report.is_idle() {
        tracing::debug!(observations = report.observations, "cycle idle");
    } else {
        tracing::info!(
            observations = report.observations,
            fired = report.fired.len(),
            dispatched = report.dispatched.len(),
            suppressed = report.suppressed.len(),
            "cycle complete",
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::action::{ActionQueue, Dispatcher, HandlerRegistry, Priority};
    use crate::clock::ManualClock;
    use crate::observe::{Collector, FnSource, RawObservation};
    use crate::payload;
    use crate::pipeline::{CommandRegistry, Pipeline};
    use crate::store::BoundedLog;
    use crate::trigger::{ActionTemplate, Condition, TriggerDefinition, TriggerEngine};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_cycles_from_scheduled_sources() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let mut collector = Collector::new(clock.clone());
        collector.add_source(
            Arc::new(FnSource::new("probe", "ping", || {
                Ok(vec![RawObservation::new(payload!("ok" => true))])
            })),
            Duration::from_millis(10),
        );

        let mut def = TriggerDefinition::new("pinged", Condition::Always);
        def.priority = Priority::High;
        def.cooldown_secs = 0;
        def.action = ActionTemplate {
            action_type: "notify".into(),
            params: Default::default(),
        };

        let dispatcher = Dispatcher::new(
            ActionQueue::in_memory(clock.clone()),
            HandlerRegistry::with_builtins(),
            Pipeline::new(
                CommandRegistry::default(),
                BoundedLog::in_memory(10),
                clock.clone(),
                Duration::from_secs(5),
            ),
            None,
            BoundedLog::in_memory(10),
            clock.clone(),
        );
        let control = ControlLoop::new(
            collector,
            TriggerEngine::new(vec![def], clock.clone()).unwrap(),
            dispatcher,
            Some(Priority::High),
            10,
        );
        let mut daemon = LoopDaemon::new(
            control,
            DaemonConfig {
                max_cycles: 2,
                ..DaemonConfig::default()
            },
            clock,
        );

        tokio::time::timeout(Duration::from_secs(10), daemon.run())
            .await
            .unwrap();
        assert_eq!(daemon.cycles(), 2);
        assert_eq!(daemon.control().dispatcher().log().len(), 2);
    }
}
