//! Tool input schemas reduced to what argument validation needs.
//!
//! Only the top level of a JSON Schema object is interpreted: the `required`
//! list and each property's `type`. Anything richer (unions, `anyOf`,
//! unrecognised type names) is kept as [`FieldType::Unchecked`] and passed
//! through.

use std::collections::BTreeMap;

use serde_json::Value;

use super::errors::McpError;

/// Declared type of a single top-level property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Unchecked,
}

impl FieldType {
    fn from_schema(property: &Value) -> Self {
        match property.get("type").and_then(Value::as_str) {
            Some("string") => FieldType::String,
            Some("number") => FieldType::Number,
            Some("integer") => FieldType::Integer,
            Some("boolean") => FieldType::Boolean,
            Some("array") => FieldType::Array,
            Some("object") => FieldType::Object,
            _ => FieldType::Unchecked,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Unchecked => "any",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
            }
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Unchecked => true,
        }
    }
}

/// JSON type name of a value, as reported in `TypeMismatch`.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parsed input schema of a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    required: Vec<String>,
    properties: BTreeMap<String, FieldType>,
}

impl InputSchema {
    /// Parse a JSON Schema object. Malformed parts are ignored.
    pub fn parse(schema: &Value) -> Self {
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), FieldType::from_schema(prop)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            required,
            properties,
        }
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.properties.get(name).copied()
    }

    /// Validate call arguments for `tool`.
    ///
    /// Required fields are checked first, in declared order, then the type
    /// of every supplied field that has a checked declaration. `null`
    /// arguments are treated as an empty object.
    pub fn validate(&self, tool: &str, args: &Value) -> Result<(), McpError> {
        let empty = serde_json::Map::new();
        let fields = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(McpError::TypeMismatch {
                    tool: tool.to_string(),
                    parameter: "arguments".into(),
                    expected: "object".into(),
                    actual: json_type_name(other).into(),
                })
            }
        };

        if let Some(missing) = self.required.iter().find(|name| !fields.contains_key(*name)) {
            return Err(McpError::MissingParameter {
                tool: tool.to_string(),
                parameter: missing.clone(),
            });
        }

        for (name, value) in fields {
            let Some(expected) = self.field_type(name) else {
                continue;
            };
            if !expected.accepts(value) {
                return Err(McpError::TypeMismatch {
                    tool: tool.to_string(),
                    parameter: name.clone(),
                    expected: expected.name().into(),
                    actual: json_type_name(value).into(),
                });
            }
        }

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
