//! Decoding of untyped middleware configuration into a plugin's config shape.
//!
//! The plugin supplies a zero-valued template (its `create_config` result);
//! the operator's untyped map is merged into it. The template's value kinds
//! drive conversion and input is weakly typed:
//!
//! | template | accepted input |
//! |---|---|
//! | bool | bool, number (non-zero = true), `"1"/"t"/"true"/"0"/"f"/"false"`, `""` |
//! | integer | integer, float (truncated), bool, numeric string, `""` |
//! | float | number, bool, numeric string, `""` |
//! | string | string, bool (`"1"`/`"0"`), number |
//! | array | array, comma-separated string, any single value |
//! | object | object (keys matched case-insensitively, unknown keys kept) |
//! | null | anything, taken as-is |

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("cannot decode '{field}': expected {expected}, got {found}")]
    Type {
        field: String,
        expected: &'static str,
        found: String,
    },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Populates `template` from `input`. An empty input returns the template
/// unchanged.
pub fn decode_config(template: Value, input: &Map<String, Value>) -> DecodeResult<Value> {
    if input.is_empty() {
        return Ok(template);
    }
    decode_value(template, Value::Object(input.clone()), "")
}

fn decode_value(template: Value, input: Value, field: &str) -> DecodeResult<Value> {
    if input.is_null() {
        return Ok(template);
    }

    match template {
        Value::Null => Ok(input),
        Value::Object(fields) => decode_object(fields, input, field),
        Value::Array(items) => decode_array(items, input, field),
        Value::Bool(_) => weak_bool(input, field).map(Value::Bool),
        Value::Number(n) if n.is_f64() => weak_float(input, field).map(Value::from),
        Value::Number(_) => weak_int(input, field).map(Value::from),
        Value::String(_) => weak_string(input, field).map(Value::String),
    }
}

fn decode_object(mut fields: Map<String, Value>, input: Value, field: &str) -> DecodeResult<Value> {
    let input = match input {
        Value::Object(input) => input,
        Value::Array(items) if items.is_empty() => Map::new(),
        other => return Err(mismatch(field, "object", &other)),
    };

    for (key, value) in input {
        let known = fields
            .keys()
            .find(|candidate| candidate.eq_ignore_ascii_case(&key))
            .cloned();

        match known {
            Some(name) => {
                let slot = fields.remove(&name).unwrap_or(Value::Null);
                let decoded = decode_value(slot, value, &join(field, &name))?;
                fields.insert(name, decoded);
            }
            None => {
                fields.insert(key, value);
            }
        }
    }

    Ok(Value::Object(fields))
}

fn decode_array(items: Vec<Value>, input: Value, field: &str) -> DecodeResult<Value> {
    let element = items.into_iter().next().unwrap_or(Value::Null);

    let raw = match input {
        Value::Array(values) => values,
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::String(s) => s.split(',').map(|part| Value::String(part.to_string())).collect(),
        Value::Object(map) if map.is_empty() => Vec::new(),
        Value::Object(map) => return Err(mismatch(field, "array", &Value::Object(map))),
        scalar => vec![scalar],
    };

    raw.into_iter()
        .enumerate()
        .map(|(i, value)| decode_value(element.clone(), value, &format!("{field}[{i}]")))
        .collect::<DecodeResult<Vec<_>>>()
        .map(Value::Array)
}

fn weak_bool(input: Value, field: &str) -> DecodeResult<bool> {
    match &input {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.as_str() {
            "" => Ok(false),
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
            _ => Err(mismatch(field, "bool", &input)),
        },
        _ => Err(mismatch(field, "bool", &input)),
    }
}

fn weak_int(input: Value, field: &str) -> DecodeResult<i64> {
    match &input {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| mismatch(field, "integer", &input)),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::String(s) if s.is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| mismatch(field, "integer", &input)),
        _ => Err(mismatch(field, "integer", &input)),
    }
}

fn weak_float(input: Value, field: &str) -> DecodeResult<f64> {
    match &input {
        Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(field, "float", &input)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) if s.is_empty() => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| mismatch(field, "float", &input)),
        _ => Err(mismatch(field, "float", &input)),
    }
}

fn weak_string(input: Value, field: &str) -> DecodeResult<String> {
    match input {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(if b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(mismatch(field, "string", &other)),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn mismatch(field: &str, expected: &'static str, found: &Value) -> DecodeError {
    let found = match found {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("bool {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    };
    DecodeError::Type {
        field: if field.is_empty() { "<root>".to_string() } else { field.to_string() },
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test input must be an object"),
        }
    }

    #[test]
    fn empty_input_returns_template() {
        let template = json!({"allowedIPPrefix": "", "ports": [0]});
        let decoded = decode_config(template.clone(), &Map::new()).unwrap();
        assert_eq!(decoded, template);
    }

    #[test]
    fn comma_separated_string_becomes_slice() {
        let template = json!({"prefixes": [""], "ports": [0]});
        let decoded = decode_config(
            template,
            &input(json!({"prefixes": "10.,127.", "ports": "80,443"})),
        )
        .unwrap();

        assert_eq!(decoded, json!({"prefixes": ["10.", "127."], "ports": [80, 443]}));
    }

    #[test]
    fn weak_typing_follows_template_kinds() {
        let template = json!({
            "enabled": false,
            "limit": 0,
            "ratio": 0.0,
            "name": "",
            "tags": [],
        });
        let decoded = decode_config(
            template,
            &input(json!({
                "enabled": "true",
                "limit": "42",
                "ratio": 2,
                "name": 7,
                "tags": "solo",
            })),
        )
        .unwrap();

        assert_eq!(
            decoded,
            json!({"enabled": true, "limit": 42, "ratio": 2.0, "name": "7", "tags": ["solo"]})
        );
    }

    #[test]
    fn keys_match_case_insensitively_and_extras_are_kept() {
        let template = json!({"allowedIPPrefix": "", "nested": {"Depth": 0}});
        let decoded = decode_config(
            template,
            &input(json!({"allowedipprefix": "127", "nested": {"depth": "3"}, "extra": [1]})),
        )
        .unwrap();

        assert_eq!(
            decoded,
            json!({"allowedIPPrefix": "127", "nested": {"Depth": 3}, "extra": [1]})
        );
    }

    #[test]
    fn null_template_slots_take_input_verbatim() {
        let decoded = decode_config(
            json!({"anything": null}),
            &input(json!({"anything": {"k": [1, "two"]}})),
        )
        .unwrap();
        assert_eq!(decoded, json!({"anything": {"k": [1, "two"]}}));
    }

    #[test]
    fn errors_name_the_field() {
        let err = decode_config(
            json!({"limits": {"burst": 0}}),
            &input(json!({"limits": {"burst": "lots"}})),
        )
        .unwrap_err();

        let DecodeError::Type { field, expected, .. } = &err;
        assert_eq!(field, "limits.burst");
        assert_eq!(*expected, "integer");
        assert!(err.to_string().contains("\"lots\""));
    }
}
