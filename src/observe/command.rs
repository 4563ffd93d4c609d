//! Observation source that runs a shell command and parses its JSON stdout.
//!
//! Accepted output shapes:
//! - a JSON object: one observation whose payload is the object
//! - a JSON array of objects: one observation per element
//!
//! An object with a string `kind` and an object `payload` is unwrapped, so a
//! script can emit observations of several kinds at once.

use std::time::Duration;

use crate::process::{self, ShellCommand};

use super::{ObservationSource, Payload, RawObservation, SourceError};

pub struct CommandSource {
    id: String,
    kind: String,
    command: String,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            command: command.into(),
            timeout,
        }
    }

    fn bad_output(&self, message: impl Into<String>) -> SourceError {
        SourceError::BadOutput {
            source_id: self.id.clone(),
            message: message.into(),
        }
    }

    fn parse_stdout(&self, stdout: &str) -> Result<Vec<RawObservation>, SourceError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let value: serde_json::Value =
            serde_json::from_str(trimmed).map_err(|e| self.bad_output(e.to_string()))?;
        match value {
            serde_json::Value::Object(map) => Ok(vec![Self::unwrap_object(map)]),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::Object(map) => Ok(Self::unwrap_object(map)),
                    other => Err(self.bad_output(format!(
                        "array elements must be objects, got {other}"
                    ))),
                })
                .collect(),
            other => Err(self.bad_output(format!("expected object or array, got {other}"))),
        }
    }

    fn unwrap_object(mut map: Payload) -> RawObservation {
        let wrapped = matches!(map.get("kind"), Some(serde_json::Value::String(_)))
            && matches!(map.get("payload"), Some(serde_json::Value::Object(_)));
        if wrapped {
            if let (Some(serde_json::Value::String(kind)), Some(serde_json::Value::Object(payload))) =
                (map.remove("kind"), map.remove("payload"))
            {
                return RawObservation::new(payload).with_kind(kind);
            }
        }
        RawObservation::new(map)
    }
}

impl ObservationSource for CommandSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn collect(&self) -> Result<Vec<RawObservation>, SourceError> {
        let out = process::run(&ShellCommand::new(&self.command, self.timeout)).map_err(|e| {
            SourceError::Failed {
                source_id: self.id.clone(),
                message: e.to_string(),
            }
        })?;
        if !out.success() {
            return Err(SourceError::Failed {
                source_id: self.id.clone(),
                message: out.failure_message(),
            });
        }
        self.parse_stdout(&out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(command: &str) -> CommandSource {
        CommandSource::new("cmd", "default", command, Duration::from_secs(5))
    }

    #[test]
    fn single_object_is_one_observation() {
        let obs = source(r#"echo '{"unread": 3}'"#).collect().unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].kind, None);
        assert_eq!(obs[0].payload["unread"], 3);
    }

    #[test]
    fn wrapped_objects_carry_their_kind() {
        let obs = source(
            r#"echo '[{"kind": "price", "payload": {"p": 1}}, {"kind": 5, "x": 1}]'"#,
        )
        .collect()
        .unwrap();
        assert_eq!(obs[0].kind.as_deref(), Some("price"));
        assert_eq!(obs[0].payload["p"], 1);
        // Non-string kind is just payload data.
        assert_eq!(obs[1].kind, None);
        assert_eq!(obs[1].payload["kind"], 5);
    }

    #[test]
    fn non_json_output_is_a_failure() {
        let err = source("echo hello").collect().unwrap_err();
        assert!(matches!(err, SourceError::BadOutput { .. }));
    }

    #[test]
    fn failing_command_is_a_failure() {
        let err = source("echo nope >&2; exit 1").collect().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn empty_output_is_no_observations() {
        assert!(source("true").collect().unwrap().is_empty());
    }
}
