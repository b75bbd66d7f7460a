//! Response normalization.
//!
//! The analysis engine serializes every scalar as a one-element array
//! (`{"gene": ["KIT"], "pvalue": [0.03]}`) and sometimes nests lists one level
//! too deep (`{"sites": [["S10", "Y703"]]}`). [`normalize`] walks a decoded
//! payload and rewrites those shapes into their canonical form:
//!
//! * a one-element array holding a scalar or another array is collapsed;
//! * nested objects are visited recursively;
//! * arrays of objects are tables and stay untouched;
//! * fields named in [`ResponseSchema::record_fields`] are always treated as
//!   record collections;
//! * fields named in [`ResponseSchema::list_fields`] are flattened but never
//!   collapsed to a scalar, so a one-site gene keeps `"sites": ["Y703"]`.
//!
//! Normalizing a canonical value returns it unchanged.

use serde_json::{Map, Value};

/// Field that always holds the tabular payload.
pub const RECORD_FIELD: &str = "data";

/// Per-response classification of fields whose shape is known up front.
#[derive(Debug, Clone, Copy)]
pub struct ResponseSchema {
    pub record_fields: &'static [&'static str],
    pub list_fields: &'static [&'static str],
}

/// Schema of every analysis response.
pub const ANALYSIS_SCHEMA: ResponseSchema = ResponseSchema {
    record_fields: &[RECORD_FIELD],
    list_fields: &["sites", "datasets", "cell_types", "genes", "groups", "warnings"],
};

pub fn normalize(value: Value) -> Value {
    normalize_with(value, &ANALYSIS_SCHEMA)
}

pub fn normalize_with(value: Value, schema: &ResponseSchema) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_object(map, schema)),
        Value::Array(mut items) if items.len() == 1 && items[0].is_object() => {
            match items.pop() {
                Some(Value::Object(map)) => Value::Object(normalize_object(map, schema)),
                Some(other) => Value::Array(vec![other]),
                None => Value::Array(items),
            }
        }
        other => other,
    }
}

fn normalize_object(map: Map<String, Value>, schema: &ResponseSchema) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let value = if schema.record_fields.contains(&key.as_str()) {
                records(value)
            } else if schema.list_fields.contains(&key.as_str()) {
                Value::Array(flatten(value))
            } else {
                unwrap_field(value, schema)
            };
            (key, value)
        })
        .collect()
}

fn unwrap_field(value: Value, schema: &ResponseSchema) -> Value {
    match collapse(value) {
        Value::Object(map) => Value::Object(normalize_object(map, schema)),
        other => other,
    }
}

/// Strip singleton wrappers around scalars and lists.
fn collapse(mut value: Value) -> Value {
    loop {
        match value {
            Value::Array(mut items) if items.len() == 1 && !items[0].is_object() => {
                value = items.pop().unwrap_or(Value::Null);
            }
            other => return other,
        }
    }
}

fn records(value: Value) -> Value {
    match value {
        Value::Array(mut items) if items.len() == 1 && items[0].is_array() => {
            records(items.pop().unwrap_or(Value::Null))
        }
        Value::Object(row) => Value::Array(vec![Value::Object(row)]),
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

fn flatten(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .flat_map(|item| match item {
                Value::Array(_) => flatten(item),
                other => vec![other],
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}
