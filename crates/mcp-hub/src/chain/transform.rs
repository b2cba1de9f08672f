//! Post-processing applied to a step's raw tool result before it is stored
//! in the chain context, so later steps can reference a shaped value
//! instead of a raw `CallToolResult` payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChainContext;
use super::expr::resolve_path;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Pull a JSON value out of the raw result at a dotted path.
    ExtractJson { path: String },
    /// Concatenate every `text`-typed content block in an MCP tool result.
    ExtractText,
    /// Render a template string, substituting `{{PATH}}` placeholders
    /// resolved the same way step `condition`s resolve paths.
    Template { template: String },
    /// Keep only array elements for which `predicate` (bound with `ITEM.*`)
    /// evaluates truthy.
    Filter { predicate: String },
    /// Render `template` once per array element, bound as `ITEM.*`.
    Map { template: String },
    /// Format a numeric value with a fixed number of decimal places.
    Format { decimals: usize },
}

pub fn apply(spec: &TransformSpec, raw: &Value, ctx: &ChainContext) -> Value {
    match spec {
        TransformSpec::ExtractJson { path } => extract_json(raw, path),
        TransformSpec::ExtractText => extract_text(raw),
        TransformSpec::Template { template } => Value::String(render_template(template, raw, ctx)),
        TransformSpec::Filter { predicate } => filter(raw, predicate),
        TransformSpec::Map { template } => map(raw, template, ctx),
        TransformSpec::Format { decimals } => format_number(raw, *decimals),
    }
}

fn extract_json(raw: &Value, path: &str) -> Value {
    let mut current = raw.clone();
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        let next = if let Ok(idx) = seg.parse::<usize>() {
            current.as_array().and_then(|a| a.get(idx)).cloned()
        } else {
            current.as_object().and_then(|o| o.get(seg)).cloned()
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current
}

fn extract_text(raw: &Value) -> Value {
    let Some(content) = raw.get("content").and_then(Value::as_array) else {
        return Value::String(String::new());
    };
    let mut out = String::new();
    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
    }
    Value::String(out)
}

/// Substitutes `{{PATH}}` placeholders. `PATH` is resolved against `raw`
/// first (treated as an implicit `THIS` root), falling back to the chain
/// context's `PREV.*`/`VARS.*`/`<stepId>.*` namespaces.
fn render_template(template: &str, raw: &Value, ctx: &ChainContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        let value = resolve_in_value(raw, path).or_else(|| resolve_path(path, ctx)).unwrap_or(Value::Null);
        out.push_str(&scalar_to_string(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve_in_value(root: &Value, path: &str) -> Option<Value> {
    if path == "THIS" {
        return Some(root.clone());
    }
    let stripped = path.strip_prefix("THIS.")?;
    let mut current = root.clone();
    for seg in stripped.split('.') {
        current = if let Ok(idx) = seg.parse::<usize>() {
            current.as_array()?.get(idx)?.clone()
        } else {
            current.as_object()?.get(seg)?.clone()
        };
    }
    Some(current)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn filter(raw: &Value, predicate: &str) -> Value {
    let Some(items) = raw.as_array() else { return raw.clone() };
    let kept: Vec<Value> = items
        .iter()
        .filter(|item| {
            let mut ctx = ChainContext::new(Default::default());
            ctx.variables.insert("ITEM".into(), (*item).clone());
            super::expr::evaluate_condition(&predicate.replace("ITEM.", "VARS.ITEM."), &ctx)
        })
        .cloned()
        .collect();
    Value::Array(kept)
}

fn map(raw: &Value, template: &str, ctx: &ChainContext) -> Value {
    let Some(items) = raw.as_array() else { return raw.clone() };
    Value::Array(
        items
            .iter()
            .map(|item| Value::String(render_template(template, item, ctx)))
            .collect(),
    )
}

fn format_number(raw: &Value, decimals: usize) -> Value {
    match raw.as_f64() {
        Some(n) => Value::String(format!("{n:.decimals$}")),
        None => raw.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_joins_text_blocks() {
        let raw = serde_json::json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(extract_text(&raw), Value::String("a\nb".into()));
    }

    #[test]
    fn template_substitutes_this_paths() {
        let raw = serde_json::json!({"name": "widget"});
        let ctx = ChainContext::new(Default::default());
        assert_eq!(render_template("hello {{THIS.name}}", &raw, &ctx), "hello widget");
    }

    #[test]
    fn filter_keeps_matching_items() {
        let raw = serde_json::json!([{"n": 1}, {"n": 5}, {"n": 9}]);
        let filtered = filter(&raw, "ITEM.n > 3");
        assert_eq!(filtered, serde_json::json!([{"n": 5}, {"n": 9}]));
    }

    #[test]
    fn format_number_fixes_decimals() {
        assert_eq!(format_number(&Value::from(3.14159), 2), Value::String("3.14".into()));
    }
}
