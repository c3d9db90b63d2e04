//! Schema validation of transformed records.
//!
//! [`SchemaCatalog`] is the bundled [`RecordValidator`]: a set of named
//! [`SchemaDefinition`]s declared in the sources file. It covers required keys,
//! property types, string length, a couple of formats and enumerations; anything
//! richer belongs to the host platform's own validator behind the same trait.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::contract::RecordValidator;

/// Whether the record is about to be created or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("create"),
            Operation::Update => f.write_str("update"),
        }
    }
}

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub property: String,
    pub operation: Operation,
    pub message: String,
}

impl Violation {
    pub fn new(property: impl Into<String>, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            operation,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.property, self.operation, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl PropertyType {
    fn matches(self, value: &Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Number => value.is_number(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Array => value.is_array(),
            PropertyType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyFormat {
    Uri,
    DateTime,
}

/// Rules for one property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyRule {
    #[serde(default, rename = "type")]
    pub kind: Option<PropertyType>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub format: Option<PropertyFormat>,
    #[serde(default, rename = "enum")]
    pub allowed: Vec<Value>,
}

/// A named target schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyRule>,
    #[serde(default = "default_additional_properties")]
    pub additional_properties: bool,
}

fn default_additional_properties() -> bool {
    true
}

impl SchemaDefinition {
    /// Validates a field set, returning every violation found.
    pub fn validate(&self, fields: &Map<String, Value>, operation: Operation) -> Vec<Violation> {
        let mut violations = Vec::new();

        for key in &self.required {
            match fields.get(key) {
                None | Some(Value::Null) => {
                    violations.push(Violation::new(key, operation, "is required"))
                }
                _ => {}
            }
        }

        for (key, value) in fields {
            let Some(rule) = self.properties.get(key) else {
                if !self.additional_properties {
                    violations.push(Violation::new(key, operation, "is not allowed by the schema"));
                }
                continue;
            };
            if value.is_null() {
                continue;
            }
            check_property(key, value, rule, operation, &mut violations);
        }

        violations
    }
}

fn check_property(
    key: &str,
    value: &Value,
    rule: &PropertyRule,
    operation: Operation,
    violations: &mut Vec<Violation>,
) {
    if let Some(kind) = rule.kind {
        if !kind.matches(value) {
            violations.push(Violation::new(
                key,
                operation,
                format!("expected {:?}, got {}", kind, type_name(value)).to_lowercase(),
            ));
            return;
        }
    }

    if let (Some(max), Some(s)) = (rule.max_length, value.as_str()) {
        if s.chars().count() > max {
            violations.push(Violation::new(
                key,
                operation,
                format!("exceeds maximum length of {}", max),
            ));
        }
    }

    if let (Some(format), Some(s)) = (rule.format, value.as_str()) {
        let valid = match format {
            PropertyFormat::Uri => url::Url::parse(s).is_ok(),
            PropertyFormat::DateTime => DateTime::parse_from_rfc3339(s).is_ok(),
        };
        if !valid {
            let expected = match format {
                PropertyFormat::Uri => "a valid URI",
                PropertyFormat::DateTime => "an RFC 3339 date-time",
            };
            violations.push(Violation::new(key, operation, format!("must be {}", expected)));
        }
    }

    if !rule.allowed.is_empty() && !rule.allowed.contains(value) {
        violations.push(Violation::new(key, operation, "is not one of the allowed values"));
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Named schemas, usable as a [`RecordValidator`].
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, SchemaDefinition>,
}

impl SchemaCatalog {
    pub fn new(schemas: BTreeMap<String, SchemaDefinition>) -> Self {
        Self { schemas }
    }
}

impl RecordValidator for SchemaCatalog {
    fn has_schema(&self, schema: &str) -> bool {
        self.schemas.contains_key(schema)
    }

    fn validate(
        &self,
        fields: &Map<String, Value>,
        schema: &str,
        operation: Operation,
    ) -> Vec<Violation> {
        match self.schemas.get(schema) {
            Some(definition) => definition.validate(fields, operation),
            None => vec![Violation::new(
                "$schema",
                operation,
                format!("unknown schema `{}`", schema),
            )],
        }
    }
}
