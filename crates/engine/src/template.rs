//! `{{root.path}}` placeholders.
//!
//! A path is a root name followed by `.key`, `.0` or `[0]` segments. The
//! root is `inputs`, a local such as `loop`, or a node id whose output is
//! walked. A template that is exactly one placeholder resolves to the raw
//! JSON value; anything else interpolates into a string.

use serde_json::{Map, Value};

use crate::context::{ContextSnapshot, Root};
use crate::error::EngineError;
use crate::models::NodeStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Trimmed text between the braces.
    pub raw: String,
    pub root: String,
    pub path: Vec<Segment>,
}

impl Placeholder {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (root, path) = parse_path(raw)?;
        Ok(Self {
            raw: raw.to_owned(),
            root,
            path,
        })
    }
}

/// Parses `root.a[0].b` into its root and segments.
pub fn parse_path(expr: &str) -> Result<(String, Vec<Segment>), String> {
    let mut chars = expr.chars().peekable();
    let mut root = String::new();
    while let Some(&c) = chars.peek() {
        if c == '.' || c == '[' {
            break;
        }
        root.push(c);
        chars.next();
    }
    if root.is_empty() {
        return Err(format!("'{expr}' has no root"));
    }
    if root.chars().any(char::is_whitespace) {
        return Err(format!("'{expr}' contains whitespace"));
    }

    let mut path = Vec::new();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '.' || c == '[' {
                        break;
                    }
                    key.push(c);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(format!("'{expr}' has an empty segment"));
                }
                path.push(Segment::Key(key));
            }
            '[' => {
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(format!("'{expr}' has an unclosed '['"));
                }
                let inner = inner.trim();
                if let Some(quoted) = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                {
                    path.push(Segment::Key(quoted.to_owned()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| format!("'{expr}': '[{inner}]' is not an index"))?;
                    path.push(Segment::Index(index));
                }
            }
            other => return Err(format!("'{expr}': unexpected '{other}'")),
        }
    }
    Ok((root, path))
}

/// Every placeholder in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<Placeholder>, String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in '{template}'"))?;
        found.push(Placeholder::parse(&after[..end])?);
        rest = &after[end + 2..];
    }
    Ok(found)
}

/// Every placeholder inside the string leaves of `value`.
pub fn placeholders_in_value(value: &Value) -> Result<Vec<Placeholder>, String> {
    let mut found = Vec::new();
    collect_strings(value, &mut |s| {
        found.extend(placeholders(s)?);
        Ok(())
    })?;
    Ok(found)
}

fn collect_strings(
    value: &Value,
    visit: &mut dyn FnMut(&str) -> Result<(), String>,
) -> Result<(), String> {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().try_for_each(|v| collect_strings(v, visit)),
        Value::Object(map) => map.values().try_for_each(|v| collect_strings(v, visit)),
        _ => Ok(()),
    }
}

/// Looks up a single placeholder.
pub fn lookup(
    placeholder: &Placeholder,
    ctx: &ContextSnapshot,
    node_id: &str,
) -> Result<Value, EngineError> {
    let unresolved = |reason: String| EngineError::UnresolvedPlaceholder {
        node_id: node_id.to_owned(),
        placeholder: placeholder.raw.clone(),
        reason,
    };
    let out_of_bounds =
        |index: usize, len: usize| unresolved(format!("index {index} out of bounds (len {len})"));

    let mut current = match ctx.root(&placeholder.root) {
        Some(Root::Value(value)) => value,
        Some(Root::Node(result)) => match result.status {
            NodeStatus::Succeeded => &result.output,
            NodeStatus::Failed => {
                return Err(unresolved(format!("node '{}' failed", placeholder.root)))
            }
            NodeStatus::Skipped => {
                return Err(unresolved(format!("node '{}' was skipped", placeholder.root)))
            }
        },
        None => {
            return Err(unresolved(format!(
                "'{}' has not produced a result",
                placeholder.root
            )))
        }
    };

    for segment in &placeholder.path {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map
                .get(key)
                .ok_or_else(|| unresolved(format!("missing key '{key}'")))?,
            (Segment::Key(key), Value::Array(items)) => {
                let index: usize = key
                    .parse()
                    .map_err(|_| unresolved(format!("cannot read key '{key}' of an array")))?;
                items.get(index).ok_or_else(|| out_of_bounds(index, items.len()))?
            }
            (Segment::Index(index), Value::Array(items)) => items
                .get(*index)
                .ok_or_else(|| out_of_bounds(*index, items.len()))?,
            (segment, other) => {
                return Err(unresolved(format!(
                    "cannot index {} with {segment:?}",
                    type_name(other)
                )))
            }
        };
    }
    Ok(current.clone())
}

/// Resolves a template string.
pub fn resolve(template: &str, ctx: &ContextSnapshot, node_id: &str) -> Result<Value, EngineError> {
    let malformed = |reason: String| EngineError::UnresolvedPlaceholder {
        node_id: node_id.to_owned(),
        placeholder: template.to_owned(),
        reason,
    };

    let trimmed = template.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
        if !inner.contains("{{") && !inner.contains("}}") {
            let placeholder = Placeholder::parse(inner).map_err(malformed)?;
            return lookup(&placeholder, ctx, node_id);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| malformed("unterminated placeholder".to_owned()))?;
        let placeholder = Placeholder::parse(&after[..end]).map_err(malformed)?;
        out.push_str(&to_text(&lookup(&placeholder, ctx, node_id)?));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Resolves every string leaf of a JSON value.
pub fn resolve_value(
    value: &Value,
    ctx: &ContextSnapshot,
    node_id: &str,
) -> Result<Value, EngineError> {
    match value {
        Value::String(s) if s.contains("{{") => resolve(s, ctx, node_id),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, ctx, node_id))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(v, ctx, node_id)?)))
            .collect::<Result<Map<_, _>, EngineError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolves a template and renders it as text.
pub fn resolve_text(
    template: &str,
    ctx: &ContextSnapshot,
    node_id: &str,
) -> Result<String, EngineError> {
    resolve(template, ctx, node_id).map(|v| to_text(&v))
}

/// A bare path (`inputs.items`) or a single placeholder (`{{inputs.items}}`).
pub fn resolve_source(
    source: &str,
    ctx: &ContextSnapshot,
    node_id: &str,
) -> Result<Value, EngineError> {
    if source.contains("{{") {
        return resolve(source, ctx, node_id);
    }
    let placeholder =
        Placeholder::parse(source).map_err(|reason| EngineError::UnresolvedPlaceholder {
            node_id: node_id.to_owned(),
            placeholder: source.to_owned(),
            reason,
        })?;
    lookup(&placeholder, ctx, node_id)
}

pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowExecutionContext;
    use crate::models::{NodeExecutionResult, NodeMetadata, NodeType, SkipReason};
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot() -> std::sync::Arc<ContextSnapshot> {
        let inputs = json!({"user": "ada", "items": [1, 2, 3]});
        let mut ctx = WorkflowExecutionContext::new(Uuid::new_v4(), inputs);
        ctx.record(NodeExecutionResult::succeeded(
            "fetch",
            NodeType::Tool,
            json!({"rows": [{"name": "a"}, {"name": "b"}], "count": 2}),
            NodeMetadata::default(),
        ));
        ctx.record(NodeExecutionResult::skipped(
            "maybe",
            NodeType::Llm,
            SkipReason::DependenciesSkipped,
            1,
        ));
        ctx.snapshot()
    }

    #[test]
    fn parses_dotted_and_bracketed_paths() {
        let (root, path) = parse_path("fetch.rows[1].name").unwrap();
        assert_eq!(root, "fetch");
        assert_eq!(
            path,
            vec![Segment::Key("rows".into()), Segment::Index(1), Segment::Key("name".into())]
        );
        assert!(parse_path(".x").is_err());
        assert!(parse_path("a[1").is_err());
    }

    #[test]
    fn single_placeholder_keeps_json_type() {
        let ctx = snapshot();
        assert_eq!(resolve("{{fetch.count}}", &ctx, "n").unwrap(), json!(2));
        assert_eq!(resolve(" {{ inputs.items }} ", &ctx, "n").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn mixed_text_interpolates() {
        let ctx = snapshot();
        let template = "hi {{inputs.user}}, {{fetch.count}} rows, first {{fetch.rows.0.name}}";
        let v = resolve(template, &ctx, "n").unwrap();
        assert_eq!(v, json!("hi ada, 2 rows, first a"));
    }

    #[test]
    fn resolves_nested_values() {
        let ctx = snapshot();
        let args = json!({"q": "{{inputs.user}}", "ids": ["{{fetch.count}}", 7]});
        let v = resolve_value(&args, &ctx, "n").unwrap();
        assert_eq!(v, json!({"q": "ada", "ids": [2, 7]}));
    }

    #[test]
    fn missing_paths_name_the_placeholder() {
        let ctx = snapshot();
        let err = resolve("{{fetch.rows[5]}}", &ctx, "n").unwrap_err();
        match err {
            EngineError::UnresolvedPlaceholder { placeholder, reason, .. } => {
                assert_eq!(placeholder, "fetch.rows[5]");
                assert!(reason.contains("out of bounds"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(resolve("{{nobody}}", &ctx, "n").is_err());
        assert!(resolve("{{maybe.text}}", &ctx, "n").is_err());
        assert!(resolve("{{inputs.user", &ctx, "n").is_err());
    }

    #[test]
    fn resolution_is_deterministic() {
        let ctx = snapshot();
        let template = json!({"a": "{{fetch.rows}}", "b": "n={{fetch.count}}"});
        let first = resolve_value(&template, &ctx, "n").unwrap();
        for _ in 0..10 {
            assert_eq!(resolve_value(&template, &ctx, "n").unwrap(), first);
        }
    }

    #[test]
    fn bare_source_paths_resolve() {
        let ctx = snapshot();
        assert_eq!(resolve_source("inputs.items", &ctx, "l").unwrap(), json!([1, 2, 3]));
        let rows = resolve_source("{{fetch.rows}}", &ctx, "l").unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
    }

    #[test]
    fn collects_placeholders_for_linting() {
        let value = json!({"a": "{{x.y}} and {{inputs.z}}", "b": ["{{w}}"]});
        let found = placeholders_in_value(&value).unwrap();
        let roots: Vec<_> = found.iter().map(|p| p.root.as_str()).collect();
        assert_eq!(roots, vec!["x", "inputs", "w"]);
    }
}
