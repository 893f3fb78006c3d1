//! Tool input schemas.
//!
//! Schemas are generated from argument types with `schemars` and checked with
//! a structural validator covering the subset of JSON Schema those generated
//! schemas use: `type`, `properties`, `required`, `additionalProperties`,
//! `items`, `enum`, `minimum` and `maximum`. Unknown keywords are ignored.

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Generate the input schema for an argument type.
pub fn input_schema<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }))
}

/// Validate `arguments` against `schema`.
pub fn validate(schema: &Value, arguments: &Value) -> Result<()> {
    check(schema, arguments, "arguments").map_err(Error::InvalidParams)
}

fn check(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
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
            return Err(format!(
                "{path}: expected {}, found {}",
                describe(expected),
                kind_of(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} is not one of the allowed values"));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{path}: {n} is below the minimum of {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{path}: {n} is above the maximum of {max}"));
            }
        }
    }

    match value {
        Value::Object(map) => check_object(schema, map, path),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                return Err(format!("{path}: missing required property '{name}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let additional = schema.get("additionalProperties");
    for (key, item) in map {
        let item_path = format!("{path}.{key}");
        match (properties.and_then(|p| p.get(key)), additional) {
            (Some(sub), _) => check(sub, item, &item_path)?,
            (None, Some(Value::Bool(false))) => {
                return Err(format!("{path}: unexpected property '{key}'"));
            }
            (None, Some(extra)) if extra.is_object() => check(extra, item, &item_path)?,
            (None, _) => {}
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        _ => true,
    }
}

fn describe(expected: &Value) -> String {
    match expected {
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        Value::String(t) => t.clone(),
        other => other.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
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
