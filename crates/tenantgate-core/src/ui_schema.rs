// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! UI-schema engine.
//!
//! A UI schema is an ordered list of form fields. [`normalize`] turns an
//! author-supplied document into canonical form; [`map_inputs`] validates a
//! runtime request body against it and produces the workflow inputs.
//!
//! Canonical form:
//! - keys are snake_case, unique per level (later duplicates are dropped)
//! - type aliases (`text`, `select`, `checkbox`, ...) resolve to the eight core types
//! - fields are stably sorted by `order`, then renumbered `0..n`
//! - output keys (`map_to` or key) are unique and `map_to` chains are acyclic
//!
//! Normalizing a canonical schema returns it unchanged.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Deepest allowed nesting of `object` fields.
pub const MAX_DEPTH: usize = 8;

/// Field value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Enum,
    Array,
    Object,
    FileRef,
}

impl FieldType {
    /// Resolve a type name or one of its authoring aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let ty = match snake_case(raw).as_str() {
            "string" | "str" | "text" | "textarea" | "email" | "url" | "password" | "date"
            | "datetime" => Self::String,
            "number" | "float" | "decimal" | "double" => Self::Number,
            "integer" | "int" => Self::Integer,
            "boolean" | "bool" | "checkbox" | "toggle" | "switch" => Self::Boolean,
            "enum" | "select" | "radio" | "choice" => Self::Enum,
            "array" | "list" | "multiselect" | "multi_select" => Self::Array,
            "object" | "group" | "json" => Self::Object,
            "file_ref" | "file" | "upload" | "attachment" => Self::FileRef,
            _ => return None,
        };
        Some(ty)
    }
}

/// One form field in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_to: Option<String>,
    pub order: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

impl Field {
    /// Key under which the field's value is written.
    pub fn output_key(&self) -> &str {
        self.map_to.as_deref().unwrap_or(&self.key)
    }
}

/// Canonical UI schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    /// Canonical JSON document.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Top-level `key -> map_to` pairs, for fields that remap.
    pub fn input_mapping(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter_map(|f| f.map_to.clone().map(|to| (f.key.clone(), to)))
            .collect()
    }
}

/// Validation failure code for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorCode {
    Required,
    TypeMismatch,
    MinLength,
    MaxLength,
    MinValue,
    MaxValue,
    Pattern,
    Enum,
    MinItems,
    MaxItems,
}

/// Validation failure for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field key; nested fields use dotted paths.
    pub field: String,
    pub code: FieldErrorCode,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, code: FieldErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code,
            message: message.into(),
        }
    }
}

/// Result of [`map_inputs`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedInputs {
    /// Values of valid fields, keyed by output key.
    pub values: Map<String, Value>,
    /// Every validation failure, in schema order.
    pub errors: Vec<FieldError>,
}

impl MappedInputs {
    /// Mapped values, or [`Error::InvalidInputs`] carrying all failures.
    pub fn into_result(self) -> Result<Map<String, Value>> {
        if self.errors.is_empty() {
            Ok(self.values)
        } else {
            Err(Error::InvalidInputs(self.errors))
        }
    }
}

/// Lowercase snake_case form of a key.
///
/// The result is a fixed point: it holds only lowercase alphanumerics and
/// single inner underscores, so `snake_case(snake_case(x)) == snake_case(x)`.
pub fn snake_case(raw: &str) -> String {
    fn separate(out: &mut String) {
        if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }

    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower_or_digit = false;
    for ch in raw.trim().chars() {
        if !ch.is_alphanumeric() {
            separate(&mut out);
            prev_lower_or_digit = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower_or_digit {
            separate(&mut out);
        }
        // Lowercasing may yield combining marks ("İ" becomes "i\u{307}").
        for lower in ch.to_lowercase() {
            if lower.is_alphanumeric() {
                out.push(lower);
            } else {
                separate(&mut out);
            }
        }
        prev_lower_or_digit = ch.is_lowercase() || ch.is_ascii_digit();
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidRequest(format!("ui_schema: {}", msg.into()))
}

/// Canonicalize a raw UI-schema document.
///
/// Accepts `{"fields": [...]}`, the legacy `{"blocks": [...]}`, a bare array,
/// or null / `{}` for an empty form.
pub fn normalize(raw: &Value) -> Result<Schema> {
    let entries = match raw {
        Value::Null => return Ok(Schema::default()),
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("fields").or_else(|| obj.get("blocks")) {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Null) | None => return Ok(Schema::default()),
            Some(_) => return Err(invalid("`fields` must be an array")),
        },
        _ => return Err(invalid("schema must be an object or an array")),
    };
    Ok(Schema {
        fields: normalize_fields(entries, 1, "")?,
    })
}

fn normalize_fields(entries: &[Value], depth: usize, path: &str) -> Result<Vec<Field>> {
    if depth > MAX_DEPTH {
        return Err(invalid(format!(
            "fields nested deeper than {MAX_DEPTH} levels at '{path}'"
        )));
    }

    let mut seen = HashSet::new();
    let mut fields: Vec<(i64, Field)> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let field = parse_field(entry, depth, path, index)?;
        if !seen.insert(field.key.clone()) {
            continue;
        }
        fields.push((field.order, field));
    }
    fields.sort_by_key(|(order, _)| *order);

    let fields: Vec<Field> = fields
        .into_iter()
        .enumerate()
        .map(|(i, (_, mut f))| {
            f.order = i as i64;
            f
        })
        .collect();

    let mut outputs = BTreeSet::new();
    for field in &fields {
        if !outputs.insert(field.output_key().to_string()) {
            return Err(invalid(format!(
                "output key '{}' is produced by more than one field",
                field.output_key()
            )));
        }
    }
    check_map_to_cycles(&fields)?;
    Ok(fields)
}

fn parse_field(entry: &Value, depth: usize, path: &str, index: usize) -> Result<Field> {
    let obj = entry
        .as_object()
        .ok_or_else(|| invalid(format!("field #{index} at '{path}' is not an object")))?;

    let raw_key = obj
        .get("key")
        .or_else(|| obj.get("name"))
        .or_else(|| obj.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let key = snake_case(raw_key);
    if key.is_empty() {
        return Err(invalid(format!("field #{index} at '{path}' has no key")));
    }
    let here = if path.is_empty() {
        key.clone()
    } else {
        format!("{path}.{key}")
    };

    let raw_type = obj
        .get("type")
        .or_else(|| obj.get("field_type"))
        .and_then(Value::as_str)
        .unwrap_or("string");
    let field_type = FieldType::parse(raw_type)
        .ok_or_else(|| invalid(format!("field '{here}' has unknown type '{raw_type}'")))?;

    let number = |name: &str, alt: &str| obj.get(name).or_else(|| obj.get(alt)).and_then(Value::as_f64);
    let (min, max) = match field_type {
        FieldType::String => (number("min", "min_length"), number("max", "max_length")),
        FieldType::Array => (number("min", "min_items"), number("max", "max_items")),
        _ => (number("min", "minimum"), number("max", "maximum")),
    };
    if let (Some(lo), Some(hi)) = (min, max)
        && lo > hi
    {
        return Err(invalid(format!("field '{here}' has min {lo} above max {hi}")));
    }

    let pattern = obj
        .get("pattern")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    if let Some(p) = &pattern {
        Regex::new(p).map_err(|e| invalid(format!("field '{here}' has invalid pattern: {e}")))?;
    }

    let enum_values: Vec<Value> = match obj.get("enum_values").or_else(|| obj.get("options")) {
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::Object(o) => o.get("value").cloned().unwrap_or(Value::Null),
                other => other.clone(),
            })
            .filter(|v| !v.is_null())
            .collect(),
        _ => Vec::new(),
    };
    if field_type == FieldType::Enum && enum_values.is_empty() {
        return Err(invalid(format!("enum field '{here}' has no values")));
    }

    let map_to = obj
        .get("map_to")
        .or_else(|| obj.get("mapTo"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let fields = match (field_type, obj.get("fields")) {
        (FieldType::Object, Some(Value::Array(children))) => {
            normalize_fields(children, depth + 1, &here)?
        }
        (FieldType::Object, Some(Value::Null) | None) => Vec::new(),
        (FieldType::Object, Some(_)) => {
            return Err(invalid(format!("field '{here}' has non-array `fields`")));
        }
        _ => Vec::new(),
    };

    Ok(Field {
        key,
        field_type,
        required: obj.get("required").and_then(Value::as_bool).unwrap_or(false),
        label: obj.get("label").and_then(Value::as_str).map(str::to_string),
        min,
        max,
        pattern,
        enum_values,
        map_to,
        order: obj
            .get("order")
            .and_then(Value::as_i64)
            .unwrap_or(i64::MAX),
        fields,
    })
}

/// Reject `map_to` chains that lead back to their origin, e.g. `a -> b`, `b -> a`.
fn check_map_to_cycles(fields: &[Field]) -> Result<()> {
    let targets: BTreeMap<&str, &str> = fields
        .iter()
        .filter_map(|f| f.map_to.as_deref().map(|to| (f.key.as_str(), to)))
        .collect();
    for start in targets.keys() {
        let mut visited = BTreeSet::from([*start]);
        let mut current = *start;
        while let Some(next) = targets.get(current) {
            let next = *next;
            if next == current {
                break;
            }
            if !visited.insert(next) {
                return Err(invalid(format!("circular map_to chain through '{start}'")));
            }
            current = next;
        }
    }
    Ok(())
}

/// Validate `raw` against `schema` and build the mapped inputs.
///
/// Every field is checked; all failures are collected. Keys not in the schema
/// are dropped.
pub fn map_inputs(schema: &Schema, raw: &Value) -> MappedInputs {
    let empty = Map::new();
    let input = raw.as_object().unwrap_or(&empty);
    let mut out = MappedInputs::default();
    map_level(&schema.fields, input, "", &mut out.values, &mut out.errors);
    out
}

fn map_level(
    fields: &[Field],
    input: &Map<String, Value>,
    path: &str,
    values: &mut Map<String, Value>,
    errors: &mut Vec<FieldError>,
) {
    for field in fields {
        let name = if path.is_empty() {
            field.key.clone()
        } else {
            format!("{path}.{}", field.key)
        };
        let raw = input.get(&field.key);
        let missing = match raw {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        };
        if missing {
            if field.required {
                errors.push(FieldError::new(&name, FieldErrorCode::Required, "is required"));
            }
            continue;
        }
        let Some(raw) = raw else { continue };
        if let Some(value) = check_field(field, raw, &name, errors) {
            values.insert(field.output_key().to_string(), value);
        }
    }
}

fn check_field(field: &Field, raw: &Value, name: &str, errors: &mut Vec<FieldError>) -> Option<Value> {
    let before = errors.len();
    let mismatch = |errors: &mut Vec<FieldError>, expected: &str| {
        errors.push(FieldError::new(
            name,
            FieldErrorCode::TypeMismatch,
            format!("expected {expected}"),
        ));
        None
    };

    let value = match field.field_type {
        FieldType::String => {
            let Some(s) = raw.as_str() else {
                return mismatch(errors, "a string");
            };
            let len = s.chars().count() as f64;
            if let Some(min) = field.min
                && len < min
            {
                errors.push(FieldError::new(
                    name,
                    FieldErrorCode::MinLength,
                    format!("must be at least {min} characters"),
                ));
            }
            if let Some(max) = field.max
                && len > max
            {
                errors.push(FieldError::new(
                    name,
                    FieldErrorCode::MaxLength,
                    format!("must be at most {max} characters"),
                ));
            }
            if let Some(pattern) = &field.pattern
                && !Regex::new(pattern).is_ok_and(|re| re.is_match(s))
            {
                errors.push(FieldError::new(
                    name,
                    FieldErrorCode::Pattern,
                    format!("must match {pattern}"),
                ));
            }
            Value::String(s.to_string())
        }
        FieldType::Number => {
            let Some(n) = coerce_number(raw) else {
                return mismatch(errors, "a number");
            };
            let below = field.min.is_some_and(|min| n < min);
            let above = field.max.is_some_and(|max| n > max);
            check_range(field, below, above, name, errors);
            serde_json::Number::from_f64(n).map(Value::Number)?
        }
        FieldType::Integer => {
            let Some(n) = coerce_integer(raw) else {
                return mismatch(errors, "an integer");
            };
            // Bounds are compared in i128 so that no i64 is rounded.
            let below = field.min.is_some_and(|min| i128::from(n) < min.ceil() as i128);
            let above = field.max.is_some_and(|max| i128::from(n) > max.floor() as i128);
            check_range(field, below, above, name, errors);
            Value::from(n)
        }
        FieldType::Boolean => match raw {
            Value::Bool(b) => Value::Bool(*b),
            _ => return mismatch(errors, "a boolean"),
        },
        FieldType::Enum => {
            if !field.enum_values.contains(raw) {
                errors.push(FieldError::new(
                    name,
                    FieldErrorCode::Enum,
                    "is not one of the allowed values",
                ));
            }
            raw.clone()
        }
        FieldType::Array => {
            let Some(items) = raw.as_array() else {
                return mismatch(errors, "an array");
            };
            let len = items.len() as f64;
            if let Some(min) = field.min
                && len < min
            {
                errors.push(FieldError::new(
                    name,
                    FieldErrorCode::MinItems,
                    format!("must have at least {min} items"),
                ));
            }
            if let Some(max) = field.max
                && len > max
            {
                errors.push(FieldError::new(
                    name,
                    FieldErrorCode::MaxItems,
                    format!("must have at most {max} items"),
                ));
            }
            raw.clone()
        }
        FieldType::Object => {
            let Some(obj) = raw.as_object() else {
                return mismatch(errors, "an object");
            };
            if field.fields.is_empty() {
                raw.clone()
            } else {
                let mut nested = Map::new();
                map_level(&field.fields, obj, name, &mut nested, errors);
                Value::Object(nested)
            }
        }
        FieldType::FileRef => match raw {
            Value::String(s) if !s.trim().is_empty() => raw.clone(),
            Value::Object(o)
                if o.get("id").or_else(|| o.get("url")).is_some_and(Value::is_string) =>
            {
                raw.clone()
            }
            _ => return mismatch(errors, "a file reference"),
        },
    };

    (errors.len() == before).then_some(value)
}

fn check_range(field: &Field, below: bool, above: bool, name: &str, errors: &mut Vec<FieldError>) {
    if let (true, Some(min)) = (below, field.min) {
        errors.push(FieldError::new(
            name,
            FieldErrorCode::MinValue,
            format!("must be at least {min}"),
        ));
    }
    if let (true, Some(max)) = (above, field.max) {
        errors.push(FieldError::new(
            name,
            FieldErrorCode::MaxValue,
            format!("must be at most {max}"),
        ));
    }
}

fn coerce_number(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Largest integer magnitude an `f64` can hold without a rounded neighbour.
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_991.0;

/// Exact `i64` of an integer input.
///
/// Integral literals are read without passing through `f64`. Float forms
/// (`2.0`, `1e3`) are accepted only while every integer is representable.
fn coerce_integer(raw: &Value) -> Option<i64> {
    let float = match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            if n.is_u64() {
                return None;
            }
            n.as_f64()?
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(i);
            }
            if s.parse::<i128>().is_ok() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (float.is_finite() && float.fract() == 0.0 && float.abs() <= MAX_EXACT_FLOAT_INT)
        .then_some(float as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("firstName"), "first_name");
        assert_eq!(snake_case("First Name"), "first_name");
        assert_eq!(snake_case("  order-id "), "order_id");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("__"), "");
        assert_eq!(snake_case("İd"), "i_d");
        assert_eq!(snake_case("ÜberPreis"), "über_preis");
    }

    #[test]
    fn test_normalize_is_idempotent_for_unicode_keys() {
        let raw = json!({"fields": [
            {"key": "İd", "type": "string"},
            {"key": "ΣύνολοΤιμής", "type": "number", "map_to": "ΤιμήΑ"},
            {"key": "Straße", "type": "string"},
        ]});
        let once = normalize(&raw).unwrap();
        let twice = normalize(&once.to_value()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_value(), twice.to_value());
        for key in ["i_d", "σύνολο_τιμής", "straße"] {
            assert!(once.fields.iter().any(|f| f.key == key), "missing {key}");
        }
        for field in &once.fields {
            assert_eq!(snake_case(&field.key), field.key);
        }
    }

    #[test]
    fn test_normalize_canonicalizes() {
        let raw = json!({
            "fields": [
                {"key": "Count", "type": "int", "min": 1, "order": 2},
                {"key": "title", "type": "text", "max": 80, "required": true, "order": 1},
                {"key": "COUNT", "type": "string"},
                {"key": "kind", "type": "select", "options": [{"value": "a"}, {"value": "b"}]}
            ]
        });
        let schema = normalize(&raw).unwrap();
        let keys: Vec<_> = schema.fields.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["title", "count", "kind"]);
        assert_eq!(schema.fields[1].field_type, FieldType::Integer);
        assert_eq!(schema.fields[2].enum_values, vec![json!("a"), json!("b")]);
        let orders: Vec<_> = schema.fields.iter().map(|f| f.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = json!({
            "blocks": [
                {"name": "customerEmail", "type": "email", "pattern": "^.+@.+$", "mapTo": "email"},
                {"name": "address", "type": "group", "fields": [
                    {"key": "zipCode", "type": "text", "order": 5},
                    {"key": "city", "type": "text", "order": 1}
                ]},
                {"name": "tags", "type": "list", "max_items": 3}
            ]
        });
        let once = normalize(&raw).unwrap();
        let twice = normalize(&once.to_value()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_value(), twice.to_value());
        assert_eq!(once.fields[1].fields[0].key, "city");
        assert_eq!(once.input_mapping().get("customer_email").map(String::as_str), Some("email"));
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        let cases = [
            json!({"fields": [{"type": "string"}]}),
            json!({"fields": [{"key": "a", "type": "colour"}]}),
            json!({"fields": [{"key": "a", "type": "integer", "min": 5, "max": 1}]}),
            json!({"fields": [{"key": "a", "type": "string", "pattern": "("}]}),
            json!({"fields": [{"key": "a", "type": "enum"}]}),
            json!({"fields": [{"key": "a", "map_to": "x"}, {"key": "b", "map_to": "x"}]}),
            json!({"fields": [{"key": "a", "map_to": "b"}, {"key": "b", "map_to": "a"}]}),
            json!({"fields": "nope"}),
            json!(42),
        ];
        for raw in cases {
            assert!(normalize(&raw).is_err(), "accepted {raw}");
        }
    }

    #[test]
    fn test_normalize_rejects_deep_nesting() {
        let mut raw = json!({"key": "leaf", "type": "string"});
        for i in 0..MAX_DEPTH {
            raw = json!({"key": format!("level{i}"), "type": "object", "fields": [raw]});
        }
        assert!(normalize(&json!([raw])).is_err());
    }

    #[test]
    fn test_empty_documents() {
        assert!(normalize(&Value::Null).unwrap().fields.is_empty());
        assert!(normalize(&json!({})).unwrap().fields.is_empty());
    }

    fn form() -> Schema {
        normalize(&json!({"fields": [
            {"key": "title", "type": "string", "required": true, "max": 80},
            {"key": "count", "type": "integer", "required": true, "min": 1},
        ]}))
        .unwrap()
    }

    #[test]
    fn test_map_inputs_collects_all_errors() {
        let body = json!({"title": "x".repeat(150), "count": 0});
        let mapped = map_inputs(&form(), &body);
        let got: Vec<_> = mapped
            .errors
            .iter()
            .map(|e| (e.field.as_str(), e.code))
            .collect();
        assert_eq!(
            got,
            vec![
                ("title", FieldErrorCode::MaxLength),
                ("count", FieldErrorCode::MinValue)
            ]
        );
        let details = serde_json::to_value(&mapped.errors).unwrap();
        assert_eq!(details[0]["code"], "max_length");
    }

    #[test]
    fn test_map_inputs_maps_and_coerces() {
        let schema = normalize(&json!({"fields": [
            {"key": "count", "type": "integer", "map_to": "qty"},
            {"key": "price", "type": "number"},
            {"key": "ok", "type": "boolean"},
        ]}))
        .unwrap();
        let mapped = map_inputs(
            &schema,
            &json!({"count": "3", "price": " 2.5 ", "ok": true, "extra": 1}),
        );
        assert!(mapped.errors.is_empty());
        assert_eq!(
            Value::Object(mapped.values),
            json!({"qty": 3, "price": 2.5, "ok": true})
        );
    }

    #[test]
    fn test_integer_inputs_are_exact() {
        let schema = normalize(&json!({"fields": [
            {"key": "n", "type": "integer"},
            {"key": "small", "type": "integer", "min": -5, "max": 10},
        ]}))
        .unwrap();
        let one = |value: Value| map_inputs(&schema, &json!({ "n": value }));

        for value in [json!(9_007_199_254_740_993_i64), json!("9007199254740993")] {
            let mapped = one(value);
            assert!(mapped.errors.is_empty());
            assert_eq!(mapped.values["n"], json!(9_007_199_254_740_993_i64));
        }
        assert_eq!(one(json!(i64::MIN)).values["n"], json!(i64::MIN));
        assert_eq!(one(json!(2.0)).values["n"], json!(2));
        assert_eq!(one(json!("1e3")).values["n"], json!(1000));

        for value in [
            json!(1e19),
            json!(u64::MAX),
            json!("18446744073709551615"),
            json!(9_007_199_254_740_993.0),
            json!("2.5"),
        ] {
            let mapped = one(value.clone());
            assert_eq!(
                mapped.errors.iter().map(|e| e.code).collect::<Vec<_>>(),
                vec![FieldErrorCode::TypeMismatch],
                "{value}"
            );
            assert!(mapped.values.is_empty());
        }

        let bounded = map_inputs(&schema, &json!({"small": "11"}));
        assert_eq!(bounded.errors[0].code, FieldErrorCode::MaxValue);
        let bounded = map_inputs(&schema, &json!({"small": -6}));
        assert_eq!(bounded.errors[0].code, FieldErrorCode::MinValue);
        let bounded = map_inputs(&schema, &json!({"small": 10}));
        assert_eq!(bounded.values["small"], json!(10));
    }

    #[test]
    fn test_map_inputs_type_errors() {
        let schema = normalize(&json!({"fields": [
            {"key": "ok", "type": "boolean"},
            {"key": "n", "type": "integer"},
            {"key": "tags", "type": "array", "min": 1},
            {"key": "color", "type": "enum", "enum_values": ["red"]},
            {"key": "doc", "type": "file_ref"},
        ]}))
        .unwrap();
        let mapped = map_inputs(
            &schema,
            &json!({"ok": "true", "n": 1.5, "tags": [], "color": "blue", "doc": 7}),
        );
        let codes: Vec<_> = mapped.errors.iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![
                FieldErrorCode::TypeMismatch,
                FieldErrorCode::TypeMismatch,
                FieldErrorCode::MinItems,
                FieldErrorCode::Enum,
                FieldErrorCode::TypeMismatch,
            ]
        );
        assert!(mapped.values.is_empty());
    }

    #[test]
    fn test_nested_object_paths() {
        let schema = normalize(&json!({"fields": [
            {"key": "address", "type": "object", "fields": [
                {"key": "city", "type": "string", "required": true},
                {"key": "zip", "type": "string", "pattern": "^[0-9]{5}$"}
            ]}
        ]}))
        .unwrap();
        let mapped = map_inputs(&schema, &json!({"address": {"zip": "abc"}}));
        let fields: Vec<_> = mapped.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["address.city", "address.zip"]);

        let ok = map_inputs(&schema, &json!({"address": {"city": "Oslo", "zip": "01234"}}));
        assert_eq!(
            ok.into_result().unwrap()["address"],
            json!({"city": "Oslo", "zip": "01234"})
        );
    }

    #[test]
    fn test_optional_missing_fields_are_omitted() {
        let schema = normalize(&json!([{"key": "note", "type": "string"}])).unwrap();
        let mapped = map_inputs(&schema, &json!({}));
        assert!(mapped.errors.is_empty());
        assert!(mapped.values.is_empty());
    }
}
