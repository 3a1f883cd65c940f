//! Configuration validation: schema checks plus cross-field rules.
//!
//! The JSON Schema engine is treated as a black box producing a list of
//! (field path, message) pairs; the cross-field rules that a schema cannot
//! express (placeholder presence, variant requirements) are layered on top.

use jsonschema::error::ValidationErrorKind;
use jsonschema::paths::LocationSegment;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::schema::{schema_for_version, SUPPORTED_VERSIONS};

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the field that failed (e.g. "selectors.fields.title.kind")
    pub field_path: String,
    pub message: String,
    /// The offending value; `None` for missing fields
    pub value: Option<Value>,
}

/// A non-fatal validation issue.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field_path: String,
    pub message: String,
}

/// Result of configuration validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    fn invalid(errors: Vec<ValidationError>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings: Vec::new(),
        }
    }

    /// "field: message; field: message" over all errors.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field_path, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

const RATE_LIMIT_KNOWN_KEYS: &[&str] = &["delay_seconds", "max_concurrent"];
const RETRY_KNOWN_KEYS: &[&str] = &["max_retries", "backoff_factor"];

/// Compiled schema validators, keyed by config version so every version
/// validates against its own schema.
fn compiled_validator(version: &str, schema: &'static Value) -> Arc<jsonschema::Validator> {
    static VALIDATORS: OnceLock<Mutex<HashMap<String, Arc<jsonschema::Validator>>>> =
        OnceLock::new();
    let cache = VALIDATORS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().expect("validator cache poisoned");
    cache
        .entry(version.to_string())
        .or_insert_with(|| {
            Arc::new(jsonschema::validator_for(schema).expect("embedded schema is valid"))
        })
        .clone()
}

/// Validate a decoded configuration document.
///
/// The `version` field is checked first so an unsupported document is
/// reported as exactly one error instead of a wall of schema noise.
pub fn validate_config(config: &Value) -> ValidationResult {
    let version = match config.get("version").and_then(Value::as_str) {
        Some(v) if !v.is_empty() => v,
        _ => {
            return ValidationResult::invalid(vec![ValidationError {
                field_path: "version".into(),
                message: "'version' is a required property".into(),
                value: None,
            }]);
        }
    };

    let Some(schema) = schema_for_version(version) else {
        return ValidationResult::invalid(vec![ValidationError {
            field_path: "version".into(),
            message: format!(
                "Unsupported config version '{version}'. Supported versions: {SUPPORTED_VERSIONS:?}"
            ),
            value: Some(Value::String(version.to_string())),
        }]);
    };

    let validator = compiled_validator(version, schema);

    let mut errors: Vec<ValidationError> = Vec::new();
    let mut warnings: Vec<ValidationWarning> = Vec::new();

    for error in validator.iter_errors(config) {
        let mut field_path: String = error
            .instance_path()
            .iter()
            .map(|segment| match segment {
                LocationSegment::Property(name) => name.to_string(),
                LocationSegment::Index(index) => index.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".");

        let mut offending = Some(error.instance().clone().into_owned());
        if let ValidationErrorKind::Required { property } = error.kind() {
            // Point at the missing property itself rather than its parent.
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            field_path = if field_path.is_empty() {
                name
            } else {
                format!("{field_path}.{name}")
            };
            offending = None;
        }
        if field_path.is_empty() {
            field_path = "root".into();
        }

        errors.push(ValidationError {
            field_path,
            message: error.to_string(),
            value: offending,
        });
    }

    check_unknown_keys(config, "rate_limit", RATE_LIMIT_KNOWN_KEYS, &mut warnings);
    check_unknown_keys(config, "retry", RETRY_KNOWN_KEYS, &mut warnings);
    check_pagination_rules(config, &mut errors);
    check_auth_rules(config, &mut errors);
    check_action_rules(config, &mut errors);

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Unrecognized keys inside `rate_limit`/`retry` are warnings, not errors;
/// unknown top-level keys are accepted silently for forward compatibility.
fn check_unknown_keys(
    config: &Value,
    section: &str,
    known: &[&str],
    warnings: &mut Vec<ValidationWarning>,
) {
    let Some(map) = config.get(section).and_then(Value::as_object) else {
        return;
    };
    for key in map.keys() {
        if !known.contains(&key.as_str()) {
            warnings.push(ValidationWarning {
                field_path: format!("{section}.{key}"),
                message: format!(
                    "Unrecognized key '{key}' in section '{section}'. Known keys: {known:?}"
                ),
            });
        }
    }
}

fn check_pagination_rules(config: &Value, errors: &mut Vec<ValidationError>) {
    let pagination = config.get("pagination").cloned().unwrap_or(Value::Null);
    match pagination.get("type").and_then(Value::as_str) {
        Some("url_pattern") => {
            let base_url = config.get("base_url").and_then(Value::as_str).unwrap_or("");
            let param = pagination
                .get("param")
                .and_then(Value::as_str)
                .unwrap_or("page");
            let placeholder = format!("{{{param}}}");
            if !base_url.contains(&placeholder) {
                errors.push(ValidationError {
                    field_path: "base_url".into(),
                    message: format!(
                        "URL pattern pagination requires placeholder '{placeholder}' in base_url"
                    ),
                    value: Some(Value::String(base_url.to_string())),
                });
            }
        }
        Some("next_link") => {
            let has_selector = pagination
                .get("selector")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if !has_selector {
                errors.push(ValidationError {
                    field_path: "pagination.selector".into(),
                    message: "Next link pagination requires a 'selector'".into(),
                    value: None,
                });
            }
        }
        Some("scroll") => {
            if config.get("renderer").and_then(Value::as_str) != Some("headless") {
                errors.push(ValidationError {
                    field_path: "pagination.type".into(),
                    message: "Scroll pagination requires 'renderer: headless'".into(),
                    value: Some(Value::String("scroll".into())),
                });
            }
        }
        _ => {}
    }
}

fn check_auth_rules(config: &Value, errors: &mut Vec<ValidationError>) {
    let Some(token_from) = config
        .get("auth")
        .and_then(|a| a.get("token_from"))
        .and_then(Value::as_object)
    else {
        return;
    };
    let tf_type = token_from.get("type").and_then(Value::as_str).unwrap_or("");
    let has = |key: &str| {
        token_from
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    };
    if tf_type == "body_selector" && !has("selector") {
        errors.push(ValidationError {
            field_path: "auth.token_from.selector".into(),
            message: "token_from type 'body_selector' requires a 'selector'".into(),
            value: None,
        });
    }
    if matches!(tf_type, "header" | "cookie" | "body_json") && !has("name") {
        errors.push(ValidationError {
            field_path: "auth.token_from.name".into(),
            message: format!("token_from type '{tf_type}' requires a 'name'"),
            value: None,
        });
    }
}

fn check_action_rules(config: &Value, errors: &mut Vec<ValidationError>) {
    let actions = config
        .get("renderer_options")
        .and_then(|o| o.get("actions"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for (i, action) in actions.iter().enumerate() {
        let action_type = action.get("action").and_then(Value::as_str).unwrap_or("");
        let missing = |key: &str| action.get(key).is_none();
        if matches!(action_type, "click" | "fill" | "press" | "hover") && missing("selector") {
            errors.push(ValidationError {
                field_path: format!("renderer_options.actions[{i}].selector"),
                message: format!("Action '{action_type}' requires a 'selector'"),
                value: None,
            });
        }
        if action_type == "wait" && missing("seconds") {
            errors.push(ValidationError {
                field_path: format!("renderer_options.actions[{i}].seconds"),
                message: "Action 'wait' requires 'seconds'".into(),
                value: None,
            });
        }
        if action_type == "fill" && missing("value") {
            errors.push(ValidationError {
                field_path: format!("renderer_options.actions[{i}].value"),
                message: "Action 'fill' requires 'value'".into(),
                value: None,
            });
        }
        if action_type == "press" && missing("key") {
            errors.push(ValidationError {
                field_path: format!("renderer_options.actions[{i}].key"),
                message: "Action 'press' requires 'key'".into(),
                value: None,
            });
        }
    }
}
