//! `{placeholder}` rendering for topics and action parameters.

use serde_json::Value;

use crate::observe::ObservationRecord;

/// Transformation applied to each substituted value before it is spliced in.
pub type Escape = fn(&str) -> String;

/// Render `template`, replacing `{name}` placeholders.
///
/// Lookup order: `extra` pairs, then `{source}` / `{kind}`, then a dotted
/// payload path. Unresolvable placeholders are left verbatim.
pub fn render(template: &str, record: &ObservationRecord, extra: &[(&str, &str)]) -> String {
    render_escaped(template, record, extra, str::to_string)
}

/// Like [`render`], but every substituted value goes through `escape`.
/// Literal template text is never escaped.
pub fn render_escaped(
    template: &str,
    record: &ObservationRecord,
    extra: &[(&str, &str)],
    escape: Escape,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match lookup(name.trim(), record, extra) {
            Some(value) => out.push_str(&escape(&value)),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn lookup(name: &str, record: &ObservationRecord, extra: &[(&str, &str)]) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if let Some((_, v)) = extra.iter().find(|(k, _)| *k == name) {
        return Some((*v).to_string());
    }
    match name {
        "source" => return Some(record.source_id.clone()),
        "kind" => return Some(record.kind.clone()),
        _ => {}
    }
    record.field(name).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Render every string inside a JSON value, recursively.
pub fn render_value(value: &Value, record: &ObservationRecord, extra: &[(&str, &str)]) -> Value {
    render_value_escaped(value, record, extra, str::to_string)
}

pub fn render_value_escaped(
    value: &Value,
    record: &ObservationRecord,
    extra: &[(&str, &str)],
    escape: Escape,
) -> Value {
    match value {
        Value::String(s) => Value::String(render_escaped(s, record, extra, escape)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value_escaped(v, record, extra, escape))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value_escaped(v, record, extra, escape)))
                .collect(),
        ),
        other => other.clone(),
    }
}
