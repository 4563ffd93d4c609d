//! Flat-file persistence: whole-file JSON snapshots and bounded logs.
//!
//! Every persisted structure goes through [`JsonFile`]: load once at startup,
//! rewrite the whole file after each mutation. Writes land in a sibling temp
//! file first and are renamed into place, so a crash mid-write leaves the
//! previous snapshot intact.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors from the flat-file store.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(tripwire::store::io),
        help(
            "A filesystem operation failed. Check that the state directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {message}")]
    #[diagnostic(
        code(tripwire::store::corrupt),
        help(
            "The file is not valid JSON for the expected structure. \
             Move it aside to start from an empty state."
        )
    )]
    Corrupt { path: String, message: String },

    #[error("serialization error for {path}: {message}")]
    #[diagnostic(
        code(tripwire::store::serialize),
        help("The in-memory state could not be encoded as JSON.")
    )]
    Serialize { path: String, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A JSON snapshot file at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, or `T::default()` if it does not exist yet.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self) -> StoreResult<T> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                });
            }
        };
        if data.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&data).map_err(|e| StoreError::Corrupt {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Atomically replace the file contents with `value`.
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<()> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let body = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialize {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

/// Append-only ledger that keeps the most recent `capacity` entries.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
    file: Option<JsonFile>,
}

impl<T> BoundedLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// An in-memory log that is never written to disk.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            file: None,
        }
    }

    /// Load a persisted log, trimming it to `capacity` if the cap shrank.
    pub fn open(file: JsonFile, capacity: usize) -> StoreResult<Self> {
        let entries: VecDeque<T> = file.load_or_default()?;
        let mut log = Self {
            entries,
            capacity: capacity.max(1),
            file: Some(file),
        };
        log.evict();
        Ok(log)
    }

    /// Append an entry, evicting the oldest past capacity, then persist.
    ///
    /// A failed write is logged and the entry stays in memory.
    pub fn append(&mut self, entry: T) {
        self.entries.push_back(entry);
        self.evict();
        if let Some(file) = &self.file {
            if let Err(e) = file.save(&self.entries) {
                tracing::warn!(error = %e, "failed to persist log");
            }
        }
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    /// The last `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<&T> {
        self.entries.iter().rev().take(n).collect()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
