//! Sequential chain execution.

use std::time::{Duration, Instant};

use crate::clock::SharedClock;
use crate::process::{self, ShellCommand, shell_quote};
use crate::store::BoundedLog;

use super::registry::CommandRegistry;
use super::syntax::{PipelineStep, parse_chain};
use super::{PipelineError, PipelineExecution, PipelineStatus, StepOutput, StepResult};

/// Environment variable carrying the previous step's output.
pub const ENV_INPUT: &str = "TRIPWIRE_INPUT";
/// Environment variable carrying the 0-based step index.
pub const ENV_STEP: &str = "TRIPWIRE_STEP";

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run every step even after a failure.
    pub continue_on_error: bool,
    /// Input handed to the first step.
    pub input: Option<StepOutput>,
}

impl RunOptions {
    pub fn continue_on_error() -> Self {
        Self {
            continue_on_error: true,
            input: None,
        }
    }
}

/// The interpreter: registry, execution log and step timeout.
pub struct Pipeline {
    registry: CommandRegistry,
    log: BoundedLog<PipelineExecution>,
    clock: SharedClock,
    step_timeout: Duration,
    /// Sequence of the latest run, seeded from the log on construction.
    last_seq: u64,
}

impl Pipeline {
    pub fn new(
        registry: CommandRegistry,
        log: BoundedLog<PipelineExecution>,
        clock: SharedClock,
        step_timeout: Duration,
    ) -> Self {
        let last_seq = log.iter().map(|e| e.seq).max().unwrap_or(0);
        Self {
            registry,
            log,
            clock,
            step_timeout,
            last_seq,
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn log(&self) -> &BoundedLog<PipelineExecution> {
        &self.log
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Parse and run a chain, appending the execution to the log.
    ///
    /// Only an empty chain is an error; step failures are captured in the
    /// returned execution.
    pub fn run(
        &mut self,
        chain: &str,
        options: &RunOptions,
    ) -> Result<PipelineExecution, PipelineError> {
        let steps = parse_chain(chain);
        if steps.is_empty() {
            return Err(PipelineError::EmptyChain {
                chain: chain.to_string(),
            });
        }

        let started_at = self.clock.now_ms();
        self.last_seq += 1;
        let seq = self.last_seq;
        let id = format!("pipe-{started_at:x}-{seq:x}");
        tracing::info!(execution = %id, chain, steps = steps.len(), "pipeline started");

        let mut previous = options.input.clone();
        let mut results = Vec::with_capacity(steps.len());
        let mut any_failed = false;

        for (index, step) in steps.iter().enumerate() {
            let result = self.run_step(index, step, previous.as_ref());
            if result.success {
                previous = result.output.clone();
                tracing::debug!(execution = %id, step = index, command = %step.command_id, "step ok");
            } else {
                any_failed = true;
                tracing::warn!(
                    execution = %id,
                    step = index,
                    command = %step.command_id,
                    error = result.error.as_deref().unwrap_or(""),
                    "step failed",
                );
            }
            results.push(result);
            if any_failed && !options.continue_on_error {
                break;
            }
        }

        let execution = PipelineExecution {
            id,
            seq,
            chain: chain.to_string(),
            steps: results,
            status: if any_failed {
                PipelineStatus::Failed
            } else {
                PipelineStatus::Success
            },
            continue_on_error: options.continue_on_error,
            started_at,
            completed_at: self.clock.now_ms(),
            final_output: previous,
        };
        tracing::info!(execution = %execution.id, summary = %execution.summary(), "pipeline finished");
        self.log.append(execution.clone());
        Ok(execution)
    }

    fn run_step(
        &self,
        index: usize,
        step: &PipelineStep,
        previous: Option<&StepOutput>,
    ) -> StepResult {
        let started = Instant::now();
        let fail = |message: String| StepResult {
            command_id: step.command_id.clone(),
            inline_param: step.inline_param.clone(),
            success: false,
            output: None,
            error: Some(message),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let Some(entry) = self.registry.get(&step.command_id) else {
            return fail(format!(
                "unknown command \"{}\": not in the command registry",
                step.command_id
            ));
        };

        let mut command_line = entry.invocation.clone();
        if let Some(param) = &step.inline_param {
            command_line.push(' ');
            command_line.push_str(&shell_quote(param));
        }

        let mut cmd =
            ShellCommand::new(command_line, self.step_timeout).with_env(ENV_STEP, index.to_string());
        if let Some(input) = previous {
            cmd = cmd.with_env(ENV_INPUT, input.to_env_value());
        }

        match process::run(&cmd) {
            Ok(out) => {
                let success = out.success();
                StepResult {
                    command_id: step.command_id.clone(),
                    inline_param: step.inline_param.clone(),
                    success,
                    output: Some(StepOutput::from_stdout(&out.stdout)),
                    error: (!success).then(|| out.failure_message()),
                    duration_ms: out.elapsed.as_millis() as u64,
                }
            }
            Err(e) => fail(e.to_string()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("commands", &self.registry.len())
            .field("logged", &self.log.len())
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn pipeline(entries: &[(&str, &str)]) -> Pipeline {
        let registry = CommandRegistry::from_entries(
            entries.iter().map(|(id, inv)| ("test", *id, *inv)),
        )
        .unwrap();
        Pipeline::new(
            registry,
            BoundedLog::in_memory(100),
            Arc::new(ManualClock::new(1_000)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn output_threads_into_next_step() {
        let mut p = pipeline(&[("emit", "echo"), ("read", "printf '%s-read' \"$TRIPWIRE_INPUT\"")]);
        let exec = p.run("emit:hello -> read", &RunOptions::default()).unwrap();
        assert!(exec.succeeded());
        assert_eq!(
            exec.final_output,
            Some(StepOutput::Text("hello-read".into()))
        );
    }

    #[test]
    fn structured_output_reaches_next_step_as_json() {
        let mut p = pipeline(&[
            ("json", "echo '{\"n\": 2}'"),
            ("read", "printf %s \"$TRIPWIRE_INPUT\""),
        ]);
        let exec = p.run("json -> read", &RunOptions::default()).unwrap();
        assert_eq!(exec.steps[0].output.as_ref().unwrap().to_value()["n"], 2);
        // The second step echoes the JSON, so it parses as structured too.
        assert_eq!(exec.final_output.unwrap().to_value()["n"], 2);
    }

    #[test]
    fn first_failure_halts_by_default() {
        let mut p = pipeline(&[("echo", "false")]);
        let exec = p.run("echo:hello -> echo:world", &RunOptions::default()).unwrap();
        assert_eq!(exec.status, PipelineStatus::Failed);
        assert_eq!(exec.steps.len(), 1);
        assert_eq!(p.log().len(), 1);
    }

    #[test]
    fn continue_on_error_runs_everything() {
        let mut p = pipeline(&[("ok", "echo"), ("bad", "exit 2")]);
        let exec = p
            .run("ok:a -> bad -> ok:c", &RunOptions::continue_on_error())
            .unwrap();
        assert_eq!(exec.steps.len(), 3);
        assert_eq!(exec.steps.iter().filter(|s| s.success).count(), 2);
        assert_eq!(exec.status, PipelineStatus::Failed);
        assert!(exec.steps[1].error.as_deref().unwrap().contains("exit code 2"));
    }

    #[test]
    fn unknown_command_is_a_step_failure() {
        let mut p = pipeline(&[("ok", "echo")]);
        let exec = p.run("missing -> ok", &RunOptions::default()).unwrap();
        assert_eq!(exec.steps.len(), 1);
        assert!(exec.steps[0].error.as_deref().unwrap().contains("unknown command"));
    }

    #[test]
    fn slow_step_times_out() {
        let registry = CommandRegistry::from_entries([("t", "slow", "sleep 5")]).unwrap();
        let mut p = Pipeline::new(
            registry,
            BoundedLog::in_memory(10),
            Arc::new(ManualClock::new(0)),
            Duration::from_millis(100),
        );
        let exec = p.run("slow", &RunOptions::default()).unwrap();
        assert!(!exec.succeeded());
        assert!(exec.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let mut p = pipeline(&[]);
        assert!(matches!(
            p.run(" -> ", &RunOptions::default()),
            Err(PipelineError::EmptyChain { .. })
        ));
        assert!(p.log().is_empty());
    }
}
