//! JSON Schema definitions for config validation.
//!
//! The framework supports multiple schema versions for forward
//! compatibility: the `version` field is checked first, and the matching
//! schema is used for validation. Currently only `"1.0"` exists.

use serde_json::{json, Value};
use std::sync::OnceLock;

/// Supported schema versions.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Default values for optional configuration sections, merged one level
/// deep into decoded documents.
pub fn default_config() -> &'static Value {
    static DEFAULTS: OnceLock<Value> = OnceLock::new();
    DEFAULTS.get_or_init(|| {
        json!({
            "version": "1.0",
            "method": "GET",
            "headers": {},
            "cookies": {},
            "pagination": {
                "type": "none",
                "start": 1,
                "max_pages": 1
            },
            "output": {
                "format": "sqlite",
                "destination": "./output/",
                "mode": "append"
            },
            "rate_limit": {
                "delay_seconds": 1.0,
                "max_concurrent": 1
            },
            "retry": {
                "max_retries": 3,
                "backoff_factor": 2.0
            },
            "priority": 10,
            "gotify": {
                "server_url": null,
                "app_token": null,
                "priority": 5
            }
        })
    })
}

/// Look up the JSON Schema for a config version. Returns `None` for
/// unsupported versions; callers report that as a validation error.
pub fn schema_for_version(version: &str) -> Option<&'static Value> {
    match version {
        "1.0" => Some(config_schema_v1()),
        _ => None,
    }
}

/// JSON Schema (draft-07) for configuration version 1.0.
fn config_schema_v1() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "CWSF Configuration Schema v1.0",
            "type": "object",
            "required": ["version", "site_name", "base_url", "method", "selectors"],
            "properties": {
                "version": {
                    "type": "string",
                    "description": "Config schema version for forward compatibility"
                },
                "site_name": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Unique identifier name for the scraping target"
                },
                "base_url": {
                    "type": "string",
                    "format": "uri",
                    "description": "Base URL for the scraping target"
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST"]
                },
                "renderer": {
                    "type": "string",
                    "enum": ["plain", "headless"],
                    "description": "Engine to use for fetching pages"
                },
                "renderer_options": {
                    "type": "object",
                    "properties": {
                        "wait_until": {
                            "type": "string",
                            "enum": ["load", "domcontentloaded", "networkidle"]
                        },
                        "wait_for_selector": {
                            "type": "string",
                            "description": "Wait for this selector to appear before extracting HTML"
                        },
                        "wait_timeout_seconds": {
                            "type": "number",
                            "minimum": 0
                        },
                        "on_timeout": {
                            "type": "string",
                            "enum": ["proceed", "fail"]
                        },
                        "actions": {
                            "type": "array",
                            "description": "Actions to perform before extraction, in order",
                            "items": {
                                "type": "object",
                                "required": ["action"],
                                "properties": {
                                    "action": {
                                        "type": "string",
                                        "enum": ["click", "wait", "fill", "press", "hover"]
                                    },
                                    "selector": {"type": "string"},
                                    "seconds": {"type": "number", "minimum": 0},
                                    "value": {"type": "string"},
                                    "key": {"type": "string"}
                                }
                            }
                        }
                    }
                },
                "priority": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 100,
                    "description": "Job priority (1-100, lower is sooner)"
                },
                "headers": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "cookies": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "auth": {
                    "type": "object",
                    "required": ["login_url"],
                    "properties": {
                        "login_url": {"type": "string", "format": "uri"},
                        "method": {"type": "string", "enum": ["GET", "POST"]},
                        "payload": {"type": "object"},
                        "token_from": {
                            "type": "object",
                            "required": ["type"],
                            "properties": {
                                "type": {
                                    "type": "string",
                                    "enum": ["header", "cookie", "body_json", "body_selector"]
                                },
                                "name": {"type": "string"},
                                "selector": {"type": "string"},
                                "kind": {"type": "string", "enum": ["css", "xpath"]}
                            }
                        }
                    }
                },
                "selectors": {
                    "type": "object",
                    "required": ["fields"],
                    "properties": {
                        "container": {
                            "type": "string",
                            "description": "Selector enumerating record-holding nodes; omitted means one record per page"
                        },
                        "fields": {
                            "type": "object",
                            "minProperties": 1,
                            "additionalProperties": {
                                "type": "object",
                                "required": ["selector", "kind"],
                                "properties": {
                                    "selector": {"type": "string"},
                                    "kind": {"type": "string", "enum": ["css", "xpath"]},
                                    "transform": {
                                        "type": "string",
                                        "enum": ["strip", "regex", "cast", "default"]
                                    },
                                    "transform_pattern": {"type": "string"},
                                    "cast_type": {
                                        "type": "string",
                                        "enum": ["int", "float", "bool", "str"]
                                    }
                                }
                            }
                        }
                    }
                },
                "pagination": {
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["none", "url_pattern", "next_link", "scroll"]
                        },
                        "param": {"type": "string"},
                        "start": {"type": "integer", "minimum": 0},
                        "max_pages": {"type": "integer", "minimum": 1},
                        "selector": {
                            "type": "string",
                            "description": "Selector for the next page link (next_link only)"
                        },
                        "selector_kind": {"type": "string", "enum": ["css", "xpath"]},
                        "scroll_wait_seconds": {"type": "number", "minimum": 0}
                    }
                },
                "output": {
                    "type": "object",
                    "properties": {
                        "format": {"type": "string"},
                        "destination": {"type": "string"},
                        "mode": {"type": "string", "enum": ["append", "overwrite"]}
                    }
                },
                "schedule": {
                    "type": "object",
                    "properties": {
                        "every": {
                            "type": "string",
                            "description": "Schedule interval (e.g., '6h', '1d')"
                        }
                    }
                },
                "rate_limit": {
                    "type": "object",
                    "properties": {
                        "delay_seconds": {
                            "type": "number",
                            "exclusiveMinimum": 0,
                            "description": "Minimum delay between requests to the same origin"
                        },
                        "max_concurrent": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Maximum concurrent requests to the same origin"
                        }
                    }
                },
                "retry": {
                    "type": "object",
                    "properties": {
                        "max_retries": {"type": "integer", "minimum": 0},
                        "backoff_factor": {"type": "number", "exclusiveMinimum": 0}
                    }
                },
                "gotify": {
                    "type": "object",
                    "properties": {
                        "server_url": {"type": ["string", "null"], "format": "uri"},
                        "app_token": {"type": ["string", "null"]},
                        "priority": {"type": "integer", "minimum": 0, "maximum": 10}
                    }
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_v1_is_supported() {
        assert!(schema_for_version("1.0").is_some());
        assert!(schema_for_version("2.0").is_none());
        assert_eq!(SUPPORTED_VERSIONS, &["1.0"]);
    }

    #[test]
    fn defaults_cover_the_optional_sections() {
        let defaults = default_config();
        for key in ["method", "pagination", "output", "rate_limit", "retry", "priority", "gotify"] {
            assert!(defaults.get(key).is_some(), "missing default for {key}");
        }
    }
}
