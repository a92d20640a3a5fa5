//! Dotted-key flattening of configuration trees for tracking backends.
//!
//! Works on `serde_json::Value`, so any `Serialize` config subtree can be
//! flattened without knowing its concrete type.

use serde::Serialize;
use serde_json::Value;

/// Flatten `element` into `(dotted.key, value)` pairs.
///
/// Objects contribute `parent.key`, arrays `parent.index`. Leaves are rendered
/// without JSON quoting for strings. An empty object or array produces nothing.
pub fn flatten_value(parent: &str, element: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    walk(parent, element, &mut out);
    out
}

/// Serialize `config` and flatten it.
pub fn flatten_params<T: Serialize>(
    parent: &str,
    config: &T,
) -> Result<Vec<(String, String)>, serde_json::Error> {
    let value = serde_json::to_value(config)?;
    Ok(flatten_value(parent, &value))
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn walk(parent: &str, element: &Value, out: &mut Vec<(String, String)>) {
    match element {
        Value::Object(map) => {
            for (k, v) in map {
                walk(&join(parent, k), v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk(&join(parent, &i.to_string()), v, out);
            }
        }
        Value::String(s) => out.push((parent.to_string(), s.clone())),
        Value::Null => out.push((parent.to_string(), "None".to_string())),
        other => out.push((parent.to_string(), other.to_string())),
    }
}
