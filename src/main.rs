//! tripwire CLI: run pipelines, drive the control loop, inspect its state.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};

use tripwire::action::{ActionLogEntry, ActionQueue, ActionStatus, NewAction, Priority};
use tripwire::clock;
use tripwire::config::Config;
use tripwire::control::{self, ControlLoop, CycleReport};
use tripwire::oracle::OllamaOracle;
use tripwire::paths::TripwirePaths;
use tripwire::pipeline::{PipelineExecution, RunOptions, StepOutput};
use tripwire::store::{BoundedLog, JsonFile};
use tripwire::trigger::{TriggerEngine, TriggerEvent};

#[derive(Parser)]
#[command(name = "tripwire", version, about = "Observation → trigger → action control loop")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/tripwire/tripwire.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for cooldowns, backlog and logs (default: $XDG_STATE_HOME/tripwire).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command chain, e.g. `tripwire pipeline "fetch:BTC -> summarize"`.
    Pipeline {
        /// Chain of registered command ids joined by `->`.
        chain: String,

        /// Keep running after a step fails.
        #[arg(long)]
        continue_on_error: bool,

        /// Input for the first step (JSON is passed as structured data).
        #[arg(long)]
        input: Option<String>,

        /// Print the execution record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the commands in the registry.
    Commands,

    /// Collect observations, evaluate triggers and dispatch once.
    Cycle {
        /// Keep running, sampling each source on its own interval.
        #[arg(long)]
        watch: bool,

        /// Stop watching after this many cycles (0 = unlimited).
        #[arg(long, default_value = "0")]
        max_cycles: usize,
    },

    /// Inspect and drive the action backlog.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show recent history.
    Log {
        #[arg(value_enum)]
        which: LogKind,

        /// Number of entries, newest first.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show trigger cooldowns.
    Cooldowns {
        /// Clear the cooldown of one trigger.
        #[arg(long, conflicts_with = "reset_all")]
        reset: Option<String>,

        /// Clear every cooldown.
        #[arg(long)]
        reset_all: bool,
    },

    /// Talk to the reasoning oracle.
    Oracle {
        #[command(subcommand)]
        action: OracleAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued items in dispatch order.
    List {
        /// Include finished items.
        #[arg(long)]
        all: bool,
    },
    /// Enqueue an action by hand.
    Add {
        /// Action type (pipeline, shell, notify, task).
        action_type: String,

        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// Parameter as key=value; JSON values are parsed. Repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        #[arg(long)]
        topic: Option<String>,
    },
    /// Dispatch queued items now.
    Run {
        /// Run only this item.
        id: Option<String>,

        /// Only items at or above this tier.
        #[arg(long)]
        min_priority: Option<Priority>,

        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum OracleAction {
    /// Check that the oracle answers and has the configured model.
    Probe,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogKind {
    Actions,
    Pipelines,
    Triggers,
}

fn parse_param(s: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got \"{s}\""))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (paths, config_file) = resolve_paths(&cli)?;
    let config = Config::load(&config_file)?;

    match cli.command {
        Commands::Pipeline {
            chain,
            continue_on_error,
            input,
            json,
        } => {
            paths.ensure_dirs()?;
            let mut pipeline = control::open_pipeline(&config, &paths, clock::system())?;
            let options = RunOptions {
                continue_on_error,
                input: input.as_deref().map(StepOutput::from_stdout),
            };
            let execution = pipeline.run(&chain, &options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&execution).into_diagnostic()?);
            } else {
                print_execution(&execution);
            }
            if !execution.succeeded() {
                miette::bail!("pipeline {} failed", execution.id);
            }
        }

        Commands::Commands => {
            let registry = control::load_registry(&config, &paths)?;
            if registry.is_empty() {
                println!("No commands registered ({}).", config.registry_path(&paths.config_dir).display());
            }
            for (category, entries) in registry.by_category() {
                println!("{category}:");
                for entry in entries {
                    println!("  {:<20} {}", entry.command_id, entry.invocation);
                }
            }
        }

        Commands::Cycle { watch, max_cycles } => {
            let clock = clock::system();
            let mut control = ControlLoop::open(&config, &paths, clock.clone())?;
            if watch {
                run_watch(control, &config, clock, max_cycles)?;
            } else {
                let report = control.run_once();
                print_report(&report);
            }
        }

        Commands::Queue { action } => match action {
            QueueAction::List { all } => {
                let queue = open_queue(&config, &paths)?;
                let items: Vec<_> = if all {
                    queue.items().iter().collect()
                } else {
                    queue.queued()
                };
                if items.is_empty() {
                    println!("Queue is empty.");
                }
                for item in items {
                    println!(
                        "{}  {:<8} {:<9} {:<8} {}",
                        item.id,
                        item.priority,
                        status_label(item.status),
                        item.action_type,
                        item.topic.as_deref().or(item.error.as_deref()).unwrap_or(""),
                    );
                }
            }
            QueueAction::Add {
                action_type,
                priority,
                params,
                topic,
            } => {
                paths.ensure_dirs()?;
                let mut queue = open_queue(&config, &paths)?;
                let mut new = NewAction::new(action_type, priority).with_origin("manual");
                new.params.extend(params);
                new.topic = topic;
                let item = queue.enqueue(new)?;
                println!("Queued {}", item.id);
            }
            QueueAction::Run {
                id,
                min_priority,
                limit,
            } => {
                paths.ensure_dirs()?;
                let mut dispatcher = control::open_dispatcher(&config, &paths, clock::system())?;
                let done = match id {
                    Some(id) => vec![dispatcher.dispatch(&id)?],
                    None => dispatcher.drain(min_priority, limit)?,
                };
                if done.is_empty() {
                    println!("Nothing to dispatch.");
                }
                for entry in &done {
                    print_action(entry);
                }
            }
        },

        Commands::Log { which, limit } => match which {
            LogKind::Actions => {
                let log: BoundedLog<ActionLogEntry> =
                    BoundedLog::open(JsonFile::new(paths.action_log_file()), usize::MAX)?;
                for entry in log.recent(limit) {
                    print_action(entry);
                }
            }
            LogKind::Pipelines => {
                let log: BoundedLog<PipelineExecution> =
                    BoundedLog::open(JsonFile::new(paths.pipeline_log_file()), usize::MAX)?;
                for execution in log.recent(limit) {
                    println!("{}  {}  {}", execution.id, execution.chain, execution.summary());
                }
            }
            LogKind::Triggers => {
                let log: BoundedLog<TriggerEvent> =
                    BoundedLog::open(JsonFile::new(paths.trigger_log_file()), usize::MAX)?;
                for event in log.recent(limit) {
                    println!(
                        "{}  {:<20} {:<8} {}",
                        event.fired_at, event.trigger_id, event.priority, event.topic
                    );
                }
            }
        },

        Commands::Cooldowns { reset, reset_all } => {
            let clock = clock::system();
            let mut engine = TriggerEngine::open(
                config.triggers.clone(),
                JsonFile::new(paths.cooldowns_file()),
                BoundedLog::in_memory(1),
                clock.clone(),
            )?;
            if reset_all || reset.is_some() {
                paths.ensure_dirs()?;
                if engine.reset_cooldown(reset.as_deref()) {
                    println!("Cooldown cleared.");
                } else {
                    println!("Nothing to clear.");
                }
                return Ok(());
            }
            let now = clock.now_ms();
            for def in engine.definitions() {
                let remaining = engine.cooldowns().remaining(&def.id, def.cooldown_ms(), now);
                match engine.cooldowns().last_fired(&def.id) {
                    Some(at) if remaining > 0 => {
                        println!("{:<20} cooling down, {}s left (fired at {at})", def.id, remaining.div_ceil(1000))
                    }
                    Some(at) => println!("{:<20} ready (fired at {at})", def.id),
                    None => println!("{:<20} ready (never fired)", def.id),
                }
            }
        }

        Commands::Oracle {
            action: OracleAction::Probe,
        } => {
            let oracle = OllamaOracle::new(config.oracle.clone());
            let models = oracle.probe()?;
            println!("{} is up, {} model(s) available.", oracle.config().base_url, models.len());
            if oracle.has_model(&models) {
                println!("Model \"{}\" is available.", oracle.config().model);
            } else {
                println!(
                    "Model \"{}\" is missing; run: ollama pull {}",
                    oracle.config().model,
                    oracle.config().model
                );
            }
        }
    }

    Ok(())
}

fn resolve_paths(cli: &Cli) -> Result<(TripwirePaths, PathBuf)> {
    let mut paths = match (&cli.config, &cli.state_dir) {
        (Some(config), Some(state)) => {
            let config_dir = config.parent().map(PathBuf::from).unwrap_or_default();
            TripwirePaths::with_dirs(config_dir, state)
        }
        _ => TripwirePaths::resolve()?,
    };
    if let Some(state) = &cli.state_dir {
        paths.state_dir = state.clone();
    }
    let config_file = match &cli.config {
        Some(path) => {
            if let Some(dir) = path.parent() {
                paths.config_dir = dir.to_path_buf();
            }
            path.clone()
        }
        None => paths.config_file(),
    };
    Ok((paths, config_file))
}

fn open_queue(config: &Config, paths: &TripwirePaths) -> Result<ActionQueue> {
    Ok(ActionQueue::open(
        JsonFile::new(paths.backlog_file()),
        clock::system(),
        config.dispatch.keep_finished,
    )?)
}

#[cfg(feature = "daemon")]
fn run_watch(control: ControlLoop, config: &Config, clock: clock::SharedClock, max_cycles: usize) -> Result<()> {
    use tripwire::daemon::{DaemonConfig, LoopDaemon};

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    let daemon_config = DaemonConfig {
        dispatch_interval: std::time::Duration::from_secs(config.dispatch.tick_secs.max(1)),
        max_cycles,
        ..DaemonConfig::default()
    };
    let mut daemon = LoopDaemon::new(control, daemon_config, clock);
    runtime.block_on(daemon.run());
    Ok(())
}

#[cfg(not(feature = "daemon"))]
fn run_watch(mut control: ControlLoop, _config: &Config, _clock: clock::SharedClock, max_cycles: usize) -> Result<()> {
    let mut cycles = 0;
    loop {
        let report = control.tick();
        if !report.is_idle() {
            print_report(&report);
        }
        cycles += 1;
        if max_cycles > 0 && cycles >= max_cycles {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

fn status_label(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Queued => "queued",
        ActionStatus::Executing => "executing",
        ActionStatus::Succeeded => "succeeded",
        ActionStatus::Failed => "failed",
    }
}

fn print_execution(execution: &PipelineExecution) {
    println!("{}  {}", execution.id, execution.summary());
    for (i, step) in execution.steps.iter().enumerate() {
        let label = match &step.inline_param {
            Some(p) => format!("{}:{p}", step.command_id),
            None => step.command_id.clone(),
        };
        let mark = if step.success { "ok" } else { "FAILED" };
        println!("  {i}. {label:<24} {mark:<6} {}ms", step.duration_ms);
        if let Some(err) = &step.error {
            println!("     {err}");
        }
    }
    if let Some(output) = &execution.final_output {
        println!("{}", output.to_env_value());
    }
}

fn print_action(entry: &ActionLogEntry) {
    let mark = match (entry.success, entry.needs_human) {
        (_, true) => "NEEDS HUMAN",
        (true, false) => "ok",
        (false, false) => "FAILED",
    };
    println!(
        "{}  {:<8} {:<8} {:<11} {}",
        entry.action_id, entry.priority, entry.action_type, mark, entry.summary
    );
}

fn print_report(report: &CycleReport) {
    println!(
        "{} observation(s), {} trigger(s) fired, {} suppressed, {} condition error(s)",
        report.observations,
        report.fired.len(),
        report.suppressed.len(),
        report.condition_errors,
    );
    for id in &report.enqueued {
        println!("  queued {id}");
    }
    for entry in &report.dispatched {
        print!("  ");
        print_action(entry);
    }
}
