//! Dotted-path access into JSON documents (`"results.0.id"`).

use serde_json::{Map, Value};

/// Converts a dotted path to a JSON pointer, escaping `~` and `/` in segments.
fn pointer(path: &str) -> String {
    path.split('.').fold(String::with_capacity(path.len() + 1), |mut out, segment| {
        out.push('/');
        out.push_str(&segment.replace('~', "~0").replace('/', "~1"));
        out
    })
}

/// Returns the value at a dotted path. An empty path returns the document itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    value.pointer(&pointer(path))
}

/// Sets the value at a dotted path, creating intermediate objects.
///
/// Existing non-object intermediates are replaced by objects.
pub fn set(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
}

/// Removes the value at a dotted path, returning it.
pub fn remove(target: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => target.remove(path),
        Some((parent, leaf)) => {
            let mut current = target;
            for segment in parent.split('.') {
                current = current.get_mut(segment)?.as_object_mut()?;
            }
            current.remove(leaf)
        }
    }
}

/// Reads a value as a boolean flag, accepting `true`/`"true"`/`"1"`/`"yes"`.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}
