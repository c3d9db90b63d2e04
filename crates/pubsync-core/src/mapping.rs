//! Declarative field mappings.
//!
//! A [`FieldMapping`] turns one raw source record into a canonical field set.
//! Mappings are declared in the sources file:
//!
//! ```toml
//! [mappings.zaak-to-publication]
//! pass_through = false
//! unset = ["internal"]
//!
//! [mappings.zaak-to-publication.fields]
//! title = "omschrijving"
//! summary = "{{ toelichting }}"
//! reference = "Zaak {{ identificatie }} ({{ _run.organisatie }})"
//! "organization.oin" = "_run.oin"
//! schema_version = { constant = 2 }
//!
//! [mappings.zaak-to-publication.casts]
//! schema_version = "string"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::contract::RecordTransformer;
use crate::error::SyncError;
use crate::path;

/// How a single target field is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingRule {
    /// A fixed value.
    Constant { constant: Value },
    /// A dotted source path, or a template containing `{{ path }}` placeholders.
    Expression(String),
}

/// Coercion applied to a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cast {
    String,
    Integer,
    Boolean,
    Array,
    NullIfEmpty,
}

/// One named ruleset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Copy the raw record into the output before applying `fields`.
    #[serde(default)]
    pub pass_through: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, MappingRule>,
    /// Dotted keys removed from the output after mapping.
    #[serde(default)]
    pub unset: Vec<String>,
    #[serde(default)]
    pub casts: BTreeMap<String, Cast>,
}

impl FieldMapping {
    /// Applies the mapping to a raw record.
    ///
    /// Paths that do not resolve leave the target unset; template placeholders
    /// that do not resolve render as empty strings.
    ///
    /// # Examples
    ///
    /// ```
    /// use pubsync_core::mapping::{FieldMapping, MappingRule};
    /// use serde_json::json;
    ///
    /// let mut mapping = FieldMapping::default();
    /// mapping.fields.insert("title".into(), MappingRule::Expression("subject".into()));
    /// mapping.fields.insert(
    ///     "label".into(),
    ///     MappingRule::Expression("{{ kind }}: {{ subject }}".into()),
    /// );
    ///
    /// let out = mapping.apply(&json!({"subject": "Permit", "kind": "Decision"})).unwrap();
    /// assert_eq!(out["title"], "Permit");
    /// assert_eq!(out["label"], "Decision: Permit");
    /// ```
    pub fn apply(&self, raw: &Value) -> Result<Map<String, Value>, SyncError> {
        let mut out = match (self.pass_through, raw) {
            (true, Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        for (target, rule) in &self.fields {
            let value = match rule {
                MappingRule::Constant { constant } => Some(constant.clone()),
                MappingRule::Expression(expr) if expr.contains("{{") => Some(render(expr, raw)?),
                MappingRule::Expression(expr) => path::lookup(raw, expr.trim()).cloned(),
            };
            if let Some(value) = value {
                path::set(&mut out, target, value);
            }
        }

        for key in &self.unset {
            path::remove(&mut out, key);
        }

        for (target, cast) in &self.casts {
            if let Some(value) = path::remove(&mut out, target) {
                path::set(&mut out, target, apply_cast(value, *cast));
            }
        }

        Ok(out)
    }
}

/// Renders a `{{ path }}` template.
///
/// A template consisting of exactly one placeholder returns the raw value so
/// numbers, arrays and objects keep their type.
fn render(template: &str, raw: &Value) -> Result<Value, SyncError> {
    let trimmed = template.trim();
    if let Some(inner) = single_placeholder(trimmed) {
        return Ok(path::lookup(raw, inner).cloned().unwrap_or(Value::Null));
    }

    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            SyncError::Unexpected(format!("unterminated placeholder in template `{}`", template))
        })?;
        let key = after[..end].trim();
        match path::lookup(raw, key) {
            Some(Value::String(s)) => output.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => output.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    output.push_str(rest);

    Ok(Value::String(output))
}

fn single_placeholder(template: &str) -> Option<&str> {
    let inner = template.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn apply_cast(value: Value, cast: Cast) -> Value {
    match cast {
        Cast::String => match value {
            Value::String(_) | Value::Null => value,
            other => Value::String(other.to_string()),
        },
        Cast::Integer => match value {
            Value::String(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::Null),
            Value::Number(ref n) if n.is_f64() => n
                .as_f64()
                .map(|f| Value::from(f.trunc() as i64))
                .unwrap_or(Value::Null),
            Value::Bool(b) => Value::from(i64::from(b)),
            other => other,
        },
        Cast::Boolean => Value::Bool(path::truthy(&value)),
        Cast::Array => match value {
            Value::Array(_) => value,
            Value::Null => Value::Array(Vec::new()),
            other => Value::Array(vec![other]),
        },
        Cast::NullIfEmpty => match value {
            Value::String(ref s) if s.trim().is_empty() => Value::Null,
            Value::Array(ref a) if a.is_empty() => Value::Null,
            Value::Object(ref o) if o.is_empty() => Value::Null,
            other => other,
        },
    }
}

/// Named mappings, usable as a [`RecordTransformer`].
#[derive(Debug, Clone, Default)]
pub struct MappingCatalog {
    mappings: BTreeMap<String, FieldMapping>,
}

impl MappingCatalog {
    pub fn new(mappings: BTreeMap<String, FieldMapping>) -> Self {
        Self { mappings }
    }
}

impl RecordTransformer for MappingCatalog {
    fn has_mapping(&self, mapping: &str) -> bool {
        self.mappings.contains_key(mapping)
    }

    fn transform(&self, raw: &Value, mapping: &str) -> Result<Map<String, Value>, SyncError> {
        self.mappings
            .get(mapping)
            .ok_or_else(|| SyncError::UnresolvedReference {
                kind: "mapping",
                name: mapping.to_string(),
            })?
            .apply(raw)
    }
}
