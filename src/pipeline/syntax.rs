//! Chain syntax: `step1 -> step2:param -> step3`.

use serde::{Deserialize, Serialize};

/// Sequential operator between steps.
pub const SEQUENCE_OP: &str = "->";

/// One parsed step of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Registry id of the command to run.
    pub command_id: String,
    /// Text after the first `:`, appended to the invocation.
    pub inline_param: Option<String>,
}

/// Parse a chain expression into ordered steps.
///
/// Segments are split on `->` and trimmed; empty segments are dropped.
/// The first `:` in a segment separates the command id from its inline
/// parameter. An empty parameter (`cmd:`) counts as no parameter.
pub fn parse_chain(chain: &str) -> Vec<PipelineStep> {
    chain
        .split(SEQUENCE_OP)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once(':') {
            Some((id, param)) => {
                let param = param.trim();
                PipelineStep {
                    command_id: id.trim().to_string(),
                    inline_param: (!param.is_empty()).then(|| param.to_string()),
                }
            }
            None => PipelineStep {
                command_id: segment.to_string(),
                inline_param: None,
            },
        })
        .collect()
}

/// Make `value` safe to splice into a chain as literal text.
///
/// `->` would start a new step and a leading `:` would empty the command id,
/// so the operator is broken up and leading colons are dropped.
pub fn escape_literal(value: &str) -> String {
    value
        .replace(SEQUENCE_OP, "- >")
        .trim_start_matches(':')
        .to_string()
}

/// Render steps back into canonical chain text.
pub fn render_chain(steps: &[PipelineStep]) -> String {
    steps
        .iter()
        .map(|s| match &s.inline_param {
            Some(p) => format!("{}:{p}", s.command_id),
            None => s.command_id.clone(),
        })
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_around_operator_is_irrelevant() {
        let a = parse_chain("a -> b");
        assert_eq!(a, parse_chain("a->b"));
        assert_eq!(a, parse_chain("a  ->  b"));
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].command_id, "a");
        assert_eq!(a[1].command_id, "b");
    }

    #[test]
    fn inline_param_splits_on_first_colon() {
        let steps = parse_chain("fetch:https://example.com:8080 -> echo");
        assert_eq!(steps[0].command_id, "fetch");
        assert_eq!(
            steps[0].inline_param.as_deref(),
            Some("https://example.com:8080")
        );
        assert_eq!(steps[1].inline_param, None);
    }

    #[test]
    fn empty_segments_are_dropped() {
        let steps = parse_chain(" -> a ->  -> b -> ");
        assert_eq!(render_chain(&steps), "a -> b");
        assert!(parse_chain("   ").is_empty());
    }

    #[test]
    fn escaped_literal_stays_one_param() {
        let chain = format!("report:{}", escape_literal("BTC -> wipe_all"));
        let steps = parse_chain(&chain);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].inline_param.as_deref(), Some("BTC - > wipe_all"));
        assert_eq!(escape_literal("::x"), "x");
    }

    #[test]
    fn empty_param_is_none() {
        let steps = parse_chain("echo:  ");
        assert_eq!(steps[0].command_id, "echo");
        assert_eq!(steps[0].inline_param, None);
    }
}
