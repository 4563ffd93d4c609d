//! Declarative predicates over observation records.
//!
//! Conditions are data, declared in config:
//!
//! ```toml
//! condition = { op = "all", conditions = [
//!     { op = "greater_than", field = "change_pct", value = 5 },
//!     { op = "matches", field = "symbol", pattern = "^(BTC|ETH)$" },
//! ] }
//! ```
//!
//! A missing field never matches. A field of the wrong type, or a pattern
//! that fails to compile, is a [`ConditionError`].

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::observe::ObservationRecord;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ConditionError {
    #[error("field \"{field}\" is {found}, expected {expected}")]
    #[diagnostic(
        code(tripwire::condition::type_mismatch),
        help("The trigger condition compares a field of a type the source does not emit.")
    )]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("invalid pattern \"{pattern}\": {message}")]
    #[diagnostic(
        code(tripwire::condition::invalid_pattern),
        help("`matches` patterns use Rust regex syntax.")
    )]
    InvalidPattern { pattern: String, message: String },
}

/// A predicate over an [`ObservationRecord`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Every record matches.
    #[default]
    Always,
    /// The field is present and not null.
    Exists { field: String },
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    /// Numeric comparison; numeric strings are accepted.
    GreaterThan { field: String, value: f64 },
    LessThan { field: String, value: f64 },
    /// Substring of a string field, or element of an array field.
    Contains { field: String, value: String },
    /// Regex match against a string (or scalar rendered as string).
    Matches { field: String, pattern: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    /// Evaluate against a record.
    pub fn evaluate(&self, record: &ObservationRecord) -> Result<bool, ConditionError> {
        match self {
            Self::Always => Ok(true),
            Self::Exists { field } => Ok(record.field(field).is_some_and(|v| !v.is_null())),
            Self::Equals { field, value } => {
                Ok(record.field(field).is_some_and(|v| values_equal(v, value)))
            }
            Self::NotEquals { field, value } => {
                Ok(record.field(field).is_some_and(|v| !values_equal(v, value)))
            }
            Self::GreaterThan { field, value } => match record.field(field) {
                Some(v) => Ok(as_number(field, v)? > *value),
                None => Ok(false),
            },
            Self::LessThan { field, value } => match record.field(field) {
                Some(v) => Ok(as_number(field, v)? < *value),
                None => Ok(false),
            },
            Self::Contains { field, value } => match record.field(field) {
                None | Some(Value::Null) => Ok(false),
                Some(Value::String(s)) => Ok(s.contains(value.as_str())),
                Some(Value::Array(items)) => Ok(items.iter().any(|item| match item {
                    Value::String(s) => s == value,
                    other => other.to_string() == *value,
                })),
                Some(other) => Err(ConditionError::TypeMismatch {
                    field: field.clone(),
                    expected: "string or array",
                    found: type_name(other).into(),
                }),
            },
            Self::Matches { field, pattern } => {
                let re = compile(pattern)?;
                match record.field(field) {
                    None | Some(Value::Null) => Ok(false),
                    Some(Value::String(s)) => Ok(re.is_match(s)),
                    Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(re.is_match(&v.to_string())),
                    Some(other) => Err(ConditionError::TypeMismatch {
                        field: field.clone(),
                        expected: "string",
                        found: type_name(other).into(),
                    }),
                }
            }
            Self::All { conditions } => {
                for c in conditions {
                    if !c.evaluate(record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any { conditions } => {
                for c in conditions {
                    if c.evaluate(record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { condition } => Ok(!condition.evaluate(record)?),
        }
    }

    /// Static checks that can fail before any record is seen.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Self::Matches { pattern, .. } => compile(pattern).map(|_| ()),
            Self::All { conditions } | Self::Any { conditions } => {
                conditions.iter().try_for_each(Condition::validate)
            }
            Self::Not { condition } => condition.validate(),
            _ => Ok(()),
        }
    }
}

fn compile(pattern: &str) -> Result<regex::Regex, ConditionError> {
    regex::Regex::new(pattern).map_err(|e| ConditionError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn as_number(field: &str, value: &Value) -> Result<f64, ConditionError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ConditionError::TypeMismatch {
        field: field.to_string(),
        expected: "number",
        found: type_name(value).into(),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;

    fn record() -> ObservationRecord {
        ObservationRecord::new(
            "market",
            "price",
            payload!(
                "symbol" => "BTC",
                "change_pct" => 7.5,
                "volume" => "1200",
                "tags" => serde_json::json!(["hot", "crypto"]),
                "quote" => serde_json::json!({"bid": 10})
            ),
            0,
        )
    }

    #[test]
    fn numeric_comparisons() {
        let r = record();
        let gt = Condition::GreaterThan { field: "change_pct".into(), value: 5.0 };
        let lt = Condition::LessThan { field: "change_pct".into(), value: 5.0 };
        assert!(gt.evaluate(&r).unwrap());
        assert!(!lt.evaluate(&r).unwrap());
        // Numeric strings are accepted.
        let vol = Condition::GreaterThan { field: "volume".into(), value: 1000.0 };
        assert!(vol.evaluate(&r).unwrap());
    }

    #[test]
    fn missing_field_never_matches() {
        let r = record();
        let c = Condition::GreaterThan { field: "nope".into(), value: 0.0 };
        assert!(!c.evaluate(&r).unwrap());
        assert!(!Condition::Exists { field: "nope".into() }.evaluate(&r).unwrap());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let r = record();
        let c = Condition::GreaterThan { field: "symbol".into(), value: 1.0 };
        assert!(matches!(c.evaluate(&r), Err(ConditionError::TypeMismatch { .. })));
    }

    #[test]
    fn equality_normalizes_numbers() {
        let r = record();
        let c = Condition::Equals { field: "quote.bid".into(), value: serde_json::json!(10.0) };
        assert!(c.evaluate(&r).unwrap());
    }

    #[test]
    fn contains_and_matches() {
        let r = record();
        assert!(Condition::Contains { field: "tags".into(), value: "hot".into() }
            .evaluate(&r)
            .unwrap());
        assert!(Condition::Matches { field: "symbol".into(), pattern: "^(BTC|ETH)$".into() }
            .evaluate(&r)
            .unwrap());
    }

    #[test]
    fn combinators() {
        let r = record();
        let c = Condition::All {
            conditions: vec![
                Condition::Exists { field: "symbol".into() },
                Condition::Not {
                    condition: Box::new(Condition::Equals {
                        field: "symbol".into(),
                        value: serde_json::json!("ETH"),
                    }),
                },
            ],
        };
        assert!(c.evaluate(&r).unwrap());
        assert!(!Condition::Any { conditions: vec![] }.evaluate(&r).unwrap());
    }

    #[test]
    fn invalid_pattern_fails_validation() {
        let c = Condition::Any {
            conditions: vec![Condition::Matches { field: "x".into(), pattern: "(".into() }],
        };
        assert!(matches!(c.validate(), Err(ConditionError::InvalidPattern { .. })));
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            condition: Condition,
        }
        let w: Wrapper = toml::from_str(
            r#"condition = { op = "greater_than", field = "change_pct", value = 5 }"#,
        )
        .unwrap();
        assert_eq!(
            w.condition,
            Condition::GreaterThan { field: "change_pct".into(), value: 5.0 }
        );
    }
}
