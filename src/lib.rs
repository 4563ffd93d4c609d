// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # tripwire
//!
//! A single-process observation → trigger → action control loop, plus a
//! pipeline interpreter that chains registered commands.
//!
//! ## Architecture
//!
//! - **Observation** (`observe`): periodic sources normalized into records
//! - **Triggers** (`trigger`): declarative conditions with persisted cooldowns
//! - **Actions** (`action`): a durable priority backlog and handler dispatch,
//!   including a plan-then-execute `task` handler backed by an `oracle`
//! - **Pipelines** (`pipeline`): `a -> b:param` chains run as processes, each
//!   step's output threaded into the next
//! - **Control** (`control`, `daemon`): one serialized cycle, and a tokio
//!   scheduler that drives it continuously
//!
//! ## Library usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tripwire::clock;
//! use tripwire::pipeline::{CommandRegistry, Pipeline, RunOptions};
//! use tripwire::store::BoundedLog;
//!
//! let registry = CommandRegistry::from_entries([
//!     ("text", "greet", "echo hello"),
//!     ("text", "shout", "printf '%s' \"$TRIPWIRE_INPUT\" | tr a-z A-Z"),
//! ])
//! .unwrap();
//! let mut pipeline = Pipeline::new(
//!     registry,
//!     BoundedLog::in_memory(10),
//!     clock::system(),
//!     Duration::from_secs(30),
//! );
//! let run = pipeline.run("greet -> shout", &RunOptions::default()).unwrap();
//! assert!(run.succeeded());
//! ```

pub mod action;
pub mod clock;
pub mod config;
pub mod control;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod error;
pub mod observe;
pub mod oracle;
pub mod paths;
pub mod pipeline;
pub mod process;
pub mod store;
pub mod trigger;
