//! Literal `{name}` command templating.
//!
//! Substitution is deliberately simple: placeholders are replaced verbatim,
//! with no escaping and no expression language. Unknown placeholders are left
//! intact and logged at warn. Injection safety is a property of trusted
//! input, not of the renderer.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\}")
            .expect("placeholder regex is valid")
    })
}

/// Render a command template against a flat parameter map.
pub fn render(template: &str, params: &HashMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match params.get(name) {
                Some(value) => value.clone(),
                None => {
                    tracing::warn!(placeholder = name, "Unknown placeholder left intact");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Render a command template against a JSON context (workflow inputs plus
/// accumulated step results keyed by step id).
///
/// Dotted placeholders (`{step.field}`) walk into objects. A bare step
/// placeholder (`{step}`) whose value is a result object renders that
/// object's `raw_output`.
pub fn render_context(template: &str, context: &Map<String, Value>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match lookup(context, path) {
                Some(value) => value_to_string(value),
                None => {
                    tracing::warn!(placeholder = path, "Unknown placeholder left intact");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // A step's result object substitutes as its raw output
        Value::Object(map) => match map.get("raw_output") {
            Some(Value::String(raw)) => raw.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_params() {
        let rendered = render("echo {greeting} {name}", &params(&[("greeting", "hello"), ("name", "world")]));
        assert_eq!(rendered, "echo hello world");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let rendered = render("echo {known} {unknown}", &params(&[("known", "yes")]));
        assert_eq!(rendered, "echo yes {unknown}");
    }

    #[test]
    fn test_render_is_non_recursive() {
        // Substituted values are not themselves re-scanned
        let rendered = render("echo {a}", &params(&[("a", "{b}"), ("b", "nope")]));
        assert_eq!(rendered, "echo {b}");
    }

    #[test]
    fn test_render_context_bare_step_uses_raw_output() {
        let mut context = Map::new();
        context.insert(
            "build".to_string(),
            json!({"raw_output": "ok", "lines": ["ok"], "success": true, "has_errors": false}),
        );
        assert_eq!(render_context("echo {build}", &context), "echo ok");
    }

    #[test]
    fn test_render_context_dotted_path() {
        let mut context = Map::new();
        context.insert(
            "build".to_string(),
            json!({"raw_output": "ok", "structured_data": {"version": "1.2.3"}}),
        );
        assert_eq!(
            render_context("deploy {build.structured_data.version}", &context),
            "deploy 1.2.3"
        );
    }

    #[test]
    fn test_render_context_scalar_input() {
        let mut context = Map::new();
        context.insert("count".to_string(), json!(3));
        context.insert("env".to_string(), json!("staging"));
        assert_eq!(
            render_context("run {count} on {env}", &context),
            "run 3 on staging"
        );
    }

    #[test]
    fn test_render_context_missing_path_left_intact() {
        let mut context = Map::new();
        context.insert("build".to_string(), json!({"raw_output": "ok"}));
        assert_eq!(
            render_context("echo {build.missing.deep}", &context),
            "echo {build.missing.deep}"
        );
    }
}
