//! Value post-processing for extracted fields.
//!
//! A field may declare one named transform (strip, regex, cast); default
//! substitution always runs last when a `default` key is present. Every
//! transform maps over sequences and passes non-strings through.

use regex::Regex;
use serde_json::Value;

use crate::domain::config::{CastType, FieldConfig, TransformKind};

/// Apply the field's configured transforms to an extracted value.
pub fn apply_transforms(value: Value, field: &FieldConfig) -> Value {
    let mut value = match field.transform {
        Some(TransformKind::Strip) => strip_transform(value),
        Some(TransformKind::Regex) => regex_transform(value, field),
        Some(TransformKind::Cast) => cast_transform(value, field),
        // `default` as the named transform is covered by the final step.
        Some(TransformKind::Default) | None => value,
    };

    if field.default.is_some() {
        value = default_transform(value, field);
    }
    value
}

fn map_sequence(value: Value, f: impl Fn(Value) -> Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(f).collect()),
        other => f(other),
    }
}

/// Trim whitespace on strings; pass through everything else.
fn strip_transform(value: Value) -> Value {
    map_sequence(value, |v| match v {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other,
    })
}

/// Apply `transform_pattern`: first capture group if the pattern has one,
/// else the whole match. A non-match becomes absent.
fn regex_transform(value: Value, field: &FieldConfig) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let Some(pattern) = &field.transform_pattern else {
        log::warn!("Regex transform called without 'transform_pattern'");
        return value;
    };
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            log::warn!("Invalid transform_pattern '{pattern}': {e}");
            return value;
        }
    };

    map_sequence(value, |v| match v {
        Value::String(s) => match regex.captures(&s) {
            Some(captures) => {
                let extracted = captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str().to_string());
                match extracted {
                    Some(text) => Value::String(text),
                    None => Value::Null,
                }
            }
            None => {
                log::debug!("Regex pattern '{pattern}' did not match value: {s}");
                Value::Null
            }
        },
        other => other,
    })
}

/// Coerce to the configured `cast_type`; a failed coercion becomes absent.
fn cast_transform(value: Value, field: &FieldConfig) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let Some(cast_type) = field.cast_type else {
        log::warn!("Cast transform called without 'cast_type'");
        return value;
    };

    map_sequence(value, move |v| {
        if v.is_null() {
            return Value::Null;
        }
        let casted = cast_one(&v, cast_type);
        if casted.is_null() {
            log::warn!("Failed to cast value '{v}' to {cast_type:?}");
        }
        casted
    })
}

fn cast_one(value: &Value, cast_type: CastType) -> Value {
    match cast_type {
        CastType::Int => match value {
            Value::Number(n) => n.as_i64().map(Value::from).unwrap_or(Value::Null),
            Value::Bool(b) => Value::from(*b as i64),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        CastType::Float => match value {
            Value::Number(n) => n.as_f64().map(Value::from).unwrap_or(Value::Null),
            Value::String(s) => s.trim().parse::<f64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        CastType::Bool => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::String(s) => {
                let lowered = s.trim().to_ascii_lowercase();
                Value::Bool(matches!(lowered.as_str(), "true" | "1" | "yes" | "on"))
            }
            _ => Value::Null,
        },
        CastType::Str => match value {
            Value::String(s) => Value::String(s.clone()),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => Value::String(other.to_string()),
        },
    }
}

/// Replace absent or empty-string values with the configured default.
fn default_transform(value: Value, field: &FieldConfig) -> Value {
    let Some(default) = &field.default else {
        return value;
    };
    map_sequence(value, |v| match &v {
        Value::Null => default.clone(),
        Value::String(s) if s.is_empty() => default.clone(),
        _ => v,
    })
}
