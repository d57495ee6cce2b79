//! Template interpolation for action parameters.
//!
//! Parameter strings may contain `{{path}}` tokens whose dotted paths are
//! resolved against the execution scope (a JSON object). Unresolved tokens are
//! left exactly as written: downstream consumers rely on the placeholder
//! surviving for later resolution, so a missing path is not an error.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

/// Regex matching `{{ path }}` tokens, with optional inner whitespace.
fn token_regex() -> &'static Regex {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    TOKEN_REGEX.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid regex"))
}

/// Resolve a dotted path against a JSON value.
///
/// Returns `None` when any segment is missing; a present-but-null value
/// resolves to `Some(Value::Null)`.
pub fn resolve_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(arr) => {
                let idx: usize = segment.parse().ok()?;
                arr.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Convert a resolved value to its string form for substitution.
///
/// Strings substitute verbatim; everything else (including null) renders as
/// compact JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interpolate `{{path}}` tokens in a template string against a scope.
///
/// Tokens whose path does not fully resolve are left unchanged.
pub fn interpolate(template: &str, scope: &Value) -> String {
    token_regex()
        .replace_all(template, |caps: &regex_lite::Captures| {
            let path = caps[1].trim();
            match resolve_path(scope, path) {
                Some(value) => value_to_string(value),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Interpolate template tokens in a JSON value recursively.
///
/// Only strings are scanned; numbers, booleans, and null pass through
/// untouched. Objects and arrays are walked.
pub fn interpolate_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, scope)),
        Value::Object(obj) => {
            let mut out = serde_json::Map::new();
            for (k, v) in obj {
                out.insert(k.clone(), interpolate_value(v, scope));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(|v| interpolate_value(v, scope)).collect()),
        _ => value.clone(),
    }
}
