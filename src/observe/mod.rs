//! Observation collection: sample external state into normalized records.
//!
//! An [`ObservationSource`] produces raw observations (or fails). The
//! [`Collector`] stamps them with the source id and collection time, and
//! isolates failures: a source that errors or panics is logged and yields an
//! empty list, never aborting the rest of the cycle.

pub mod command;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Millis, SharedClock};

pub use command::CommandSource;

/// Payload of an observation: a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Why a source produced nothing this tick.
#[derive(Debug, Error, Diagnostic)]
pub enum SourceError {
    #[error("source \"{source_id}\" failed: {message}")]
    #[diagnostic(
        code(tripwire::observe::failed),
        help("The source is retried on its next scheduled tick.")
    )]
    Failed { source_id: String, message: String },

    #[error("source \"{source_id}\" returned unparseable output: {message}")]
    #[diagnostic(
        code(tripwire::observe::bad_output),
        help("Sources must print a JSON object or an array of JSON objects.")
    )]
    BadOutput { source_id: String, message: String },

    #[error("source \"{source_id}\" panicked")]
    #[diagnostic(code(tripwire::observe::panicked))]
    Panicked { source_id: String },
}

/// A normalized snapshot of external state. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub source_id: String,
    pub kind: String,
    pub payload: Payload,
    pub observed_at: Millis,
}

impl ObservationRecord {
    pub fn new(
        source_id: impl Into<String>,
        kind: impl Into<String>,
        payload: Payload,
        observed_at: Millis,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind: kind.into(),
            payload,
            observed_at,
        }
    }

    /// Look up a dotted path (`quote.price`) inside the payload.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let mut current = self.payload.get(parts.next()?)?;
        for part in parts {
            current = match current {
                serde_json::Value::Object(map) => map.get(part)?,
                serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// What a source reports before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    /// Overrides the source's default kind when set.
    pub kind: Option<String>,
    pub payload: Payload,
}

impl RawObservation {
    pub fn new(payload: Payload) -> Self {
        Self {
            kind: None,
            payload,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Something that can be sampled for observations.
pub trait ObservationSource: Send + Sync {
    /// Stable id of this source.
    fn id(&self) -> &str;

    /// Kind assigned to observations that don't name their own.
    fn kind(&self) -> &str;

    /// Sample the source once.
    fn collect(&self) -> Result<Vec<RawObservation>, SourceError>;
}

/// A source backed by a closure, for library embedding and tests.
pub struct FnSource<F> {
    id: String,
    kind: String,
    f: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> Result<Vec<RawObservation>, SourceError> + Send + Sync,
{
    pub fn new(id: impl Into<String>, kind: impl Into<String>, f: F) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            f,
        }
    }
}

impl<F> ObservationSource for FnSource<F>
where
    F: Fn() -> Result<Vec<RawObservation>, SourceError> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn collect(&self) -> Result<Vec<RawObservation>, SourceError> {
        (self.f)()
    }
}

/// A registered source and its schedule.
#[derive(Clone)]
pub struct ScheduledSource {
    pub source: Arc<dyn ObservationSource>,
    pub interval: Duration,
    next_due: Millis,
}

impl ScheduledSource {
    pub fn id(&self) -> &str {
        self.source.id()
    }
}

/// Invoke one source and normalize its output. Failures become an empty list.
pub fn collect_source(source: &dyn ObservationSource, now: Millis) -> Vec<ObservationRecord> {
    let outcome = catch_unwind(AssertUnwindSafe(|| source.collect())).unwrap_or_else(|_| {
        Err(SourceError::Panicked {
            source_id: source.id().to_string(),
        })
    });
    match outcome {
        Ok(raw) => {
            let records: Vec<_> = raw
                .into_iter()
                .map(|r| ObservationRecord {
                    source_id: source.id().to_string(),
                    kind: r.kind.unwrap_or_else(|| source.kind().to_string()),
                    payload: r.payload,
                    observed_at: now,
                })
                .collect();
            tracing::debug!(source = source.id(), count = records.len(), "source collected");
            records
        }
        Err(e) => {
            tracing::warn!(source = source.id(), error = %e, "observation source failed");
            Vec::new()
        }
    }
}

/// Holds the sources and tracks when each is next due.
pub struct Collector {
    sources: Vec<ScheduledSource>,
    clock: SharedClock,
}

impl Collector {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            sources: Vec::new(),
            clock,
        }
    }

    /// Register a source; it is due immediately.
    pub fn add_source(&mut self, source: Arc<dyn ObservationSource>, interval: Duration) {
        self.sources.push(ScheduledSource {
            source,
            interval,
            next_due: 0,
        });
    }

    pub fn sources(&self) -> &[ScheduledSource] {
        &self.sources
    }

    /// Sample every source, regardless of schedule, into one batch.
    pub fn collect_all(&mut self) -> Vec<ObservationRecord> {
        let now = self.clock.now_ms();
        let mut batch = Vec::new();
        for slot in &mut self.sources {
            batch.extend(collect_source(slot.source.as_ref(), now));
            slot.next_due = now + slot.interval.as_millis() as u64;
        }
        batch
    }

    /// Sample only the sources whose interval has elapsed.
    pub fn collect_due(&mut self) -> Vec<ObservationRecord> {
        let now = self.clock.now_ms();
        let mut batch = Vec::new();
        for slot in &mut self.sources {
            if now < slot.next_due {
                continue;
            }
            batch.extend(collect_source(slot.source.as_ref(), now));
            slot.next_due = now + slot.interval.as_millis() as u64;
        }
        batch
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Build a payload from `key => value` pairs.
#[macro_export]
macro_rules! payload {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::observe::Payload::new();
        $( map.insert(($key).to_string(), ::serde_json::json!($value)); )*
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn ok_source(id: &'static str, price: f64) -> Arc<dyn ObservationSource> {
        Arc::new(FnSource::new(id, "price", move || {
            Ok(vec![RawObservation::new(crate::payload!("price" => price))])
        }))
    }

    fn failing_source() -> Arc<dyn ObservationSource> {
        Arc::new(FnSource::new("broken", "price", || {
            Err(SourceError::Failed {
                source_id: "broken".into(),
                message: "network down".into(),
            })
        }))
    }

    #[test]
    fn failing_source_does_not_block_others() {
        let clock = ManualClock::new(5_000);
        let mut collector = Collector::new(Arc::new(clock));
        collector.add_source(failing_source(), Duration::from_secs(10));
        collector.add_source(ok_source("btc", 3.0), Duration::from_secs(10));

        let batch = collector.collect_all();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source_id, "btc");
        assert_eq!(batch[0].kind, "price");
        assert_eq!(batch[0].observed_at, 5_000);
    }

    #[test]
    fn panicking_source_yields_nothing() {
        let src: Arc<dyn ObservationSource> =
            Arc::new(FnSource::new("boom", "x", || panic!("source bug")));
        assert!(collect_source(src.as_ref(), 0).is_empty());
    }

    #[test]
    fn raw_kind_overrides_source_kind() {
        let src = FnSource::new("mail", "inbox", || {
            Ok(vec![
                RawObservation::new(Payload::new()).with_kind("urgent_mail"),
                RawObservation::new(Payload::new()),
            ])
        });
        let records = collect_source(&src, 1);
        assert_eq!(records[0].kind, "urgent_mail");
        assert_eq!(records[1].kind, "inbox");
    }

    #[test]
    fn collect_due_honours_intervals() {
        let clock = ManualClock::new(0);
        let mut collector = Collector::new(Arc::new(clock.clone()));
        collector.add_source(ok_source("fast", 1.0), Duration::from_secs(1));
        collector.add_source(ok_source("slow", 2.0), Duration::from_secs(60));

        assert_eq!(collector.collect_due().len(), 2);
        clock.advance(Duration::from_secs(2));
        let batch = collector.collect_due();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source_id, "fast");
    }

    #[test]
    fn field_walks_dotted_paths() {
        let record = ObservationRecord::new(
            "s",
            "k",
            crate::payload!("quote" => serde_json::json!({"price": 4.2, "tags": ["a", "b"]})),
            0,
        );
        assert_eq!(record.field("quote.price").unwrap(), 4.2);
        assert_eq!(record.field("quote.tags.1").unwrap(), "b");
        assert!(record.field("quote.missing").is_none());
        assert!(record.field("quote.price.deeper").is_none());
    }
}
