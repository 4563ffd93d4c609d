//! Command registry: the static catalogue of commands a chain may reference.
//!
//! On disk the registry maps a category to a list of entries. TOML form:
//!
//! ```toml
//! [[git]]
//! id = "status"
//! invocation = "git status --porcelain"
//! ```
//!
//! A `.json` file with the same shape (`{"git": [{"id": ..., "invocation": ...}]}`)
//! is also accepted. The registry is loaded once and never mutated.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::PipelineError;

/// A single registered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub command_id: String,
    pub category: String,
    pub invocation: String,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: String,
    #[serde(alias = "invocationTemplate", alias = "command")]
    invocation: String,
}

/// Immutable lookup table from command id to entry.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    entries: BTreeMap<String, CommandEntry>,
}

impl CommandRegistry {
    /// Build a registry from `(category, id, invocation)` triples.
    pub fn from_entries<I, C, D, V>(entries: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = (C, D, V)>,
        C: Into<String>,
        D: Into<String>,
        V: Into<String>,
    {
        let mut registry = Self::default();
        for (category, id, invocation) in entries {
            registry.insert(CommandEntry {
                command_id: id.into(),
                category: category.into(),
                invocation: invocation.into(),
            })?;
        }
        Ok(registry)
    }

    fn insert(&mut self, entry: CommandEntry) -> Result<(), PipelineError> {
        if entry.command_id.trim().is_empty() || entry.command_id.contains(':') {
            return Err(PipelineError::InvalidRegistry {
                path: String::new(),
                message: format!("invalid command id \"{}\"", entry.command_id),
            });
        }
        if entry.invocation.trim().is_empty() {
            return Err(PipelineError::InvalidRegistry {
                path: String::new(),
                message: format!("command \"{}\" has an empty invocation", entry.command_id),
            });
        }
        if let Some(existing) = self.entries.get(&entry.command_id) {
            return Err(PipelineError::InvalidRegistry {
                path: String::new(),
                message: format!(
                    "command \"{}\" declared in both \"{}\" and \"{}\"",
                    entry.command_id, existing.category, entry.category
                ),
            });
        }
        self.entries.insert(entry.command_id.clone(), entry);
        Ok(())
    }

    /// Load the registry file. Missing or malformed files are errors.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::RegistryRead {
            path: shown.clone(),
            source: e,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        Self::parse(&text, is_json).map_err(|e| match e {
            PipelineError::InvalidRegistry { message, .. } => PipelineError::InvalidRegistry {
                path: shown.clone(),
                message,
            },
            other => other,
        })
    }

    /// Parse registry text in TOML (or JSON when `json` is set).
    pub fn parse(text: &str, json: bool) -> Result<Self, PipelineError> {
        let raw: BTreeMap<String, Vec<RawEntry>> = if json {
            serde_json::from_str(text).map_err(|e| PipelineError::InvalidRegistry {
                path: String::new(),
                message: e.to_string(),
            })?
        } else {
            toml::from_str(text).map_err(|e| PipelineError::InvalidRegistry {
                path: String::new(),
                message: e.to_string(),
            })?
        };
        Self::from_entries(raw.into_iter().flat_map(|(category, list)| {
            list.into_iter()
                .map(move |e| (category.clone(), e.id, e.invocation))
        }))
    }

    pub fn get(&self, command_id: &str) -> Option<&CommandEntry> {
        self.entries.get(command_id)
    }

    /// All entries, sorted by id.
    pub fn entries(&self) -> impl Iterator<Item = &CommandEntry> {
        self.entries.values()
    }

    /// Entries grouped by category.
    pub fn by_category(&self) -> BTreeMap<&str, Vec<&CommandEntry>> {
        let mut grouped: BTreeMap<&str, Vec<&CommandEntry>> = BTreeMap::new();
        for entry in self.entries.values() {
            grouped.entry(entry.category.as_str()).or_default().push(entry);
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
