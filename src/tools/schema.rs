//! Argument validation against a tool's parameter schema
//!
//! Covers the JSON Schema subset models are given in practice: `type`,
//! `properties`, `required`, `enum`, `items` and `additionalProperties`.
//! Unknown keywords are ignored.

use serde_json::Value;

use crate::{Error, Result};

/// Validate `value` against `schema`
///
/// # Errors
///
/// Returns `Error::InvalidArguments` naming the first offending path
pub fn validate(schema: &Value, value: &Value) -> Result<()> {
    check(schema, value, "args")
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<()> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !matches {
            return Err(Error::InvalidArguments(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            )));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        return Err(Error::InvalidArguments(format!(
            "{path}: {value} is not one of {}",
            Value::Array(allowed.clone())
        )));
    }

    if let Value::Object(fields) = value {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(name) {
                    return Err(Error::InvalidArguments(format!(
                        "{path}: missing required field '{name}'"
                    )));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

        for (name, field) in fields {
            match properties.and_then(|p| p.get(name)) {
                Some(sub) => check(sub, field, &format!("{path}.{name}"))?,
                None if closed => {
                    return Err(Error::InvalidArguments(format!(
                        "{path}: unexpected field '{name}'"
                    )));
                }
                None => {}
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

const fn type_name(value: &Value) -> &'static str {
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
    use serde_json::json;

    use super::*;

    fn note_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "priority": {"type": "string", "enum": ["low", "high"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["text"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_valid_arguments() {
        validate(&note_schema(), &json!({"text": "buy oat milk", "priority": "low"})).unwrap();
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&note_schema(), &json!({"priority": "low"})).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(m) if m.contains("'text'")));
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let err = validate(&note_schema(), &json!({"text": 42})).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(m) if m.starts_with("args.text")));
    }

    #[test]
    fn test_enum_and_items() {
        assert!(validate(&note_schema(), &json!({"text": "a", "priority": "urgent"})).is_err());
        assert!(validate(&note_schema(), &json!({"text": "a", "tags": ["x", 1]})).is_err());
    }

    #[test]
    fn test_closed_object_rejects_extra() {
        assert!(validate(&note_schema(), &json!({"text": "a", "cmd": "rm"})).is_err());
    }

    #[test]
    fn test_integer_vs_number() {
        let schema = json!({"type": "integer"});
        assert!(validate(&schema, &json!(3)).is_ok());
        assert!(validate(&schema, &json!(3.5)).is_err());
    }
}
