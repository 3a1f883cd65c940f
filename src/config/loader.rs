//! Configuration loading: YAML decoding, defaulting, overrides, and the
//! startup directory scan.
//!
//! Parse failures (missing, unreadable, empty, malformed) are a distinct
//! error kind from validation failures so the CLI can report files as
//! `error` vs `invalid`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::validator::validate_config;
use crate::domain::config::SiteConfig;

/// A configuration file could not be read or decoded.
#[derive(Debug, Error)]
#[error("{message} (file: {})", path.display())]
pub struct ConfigParseError {
    pub message: String,
    pub path: PathBuf,
}

impl ConfigParseError {
    fn new(message: impl Into<String>, path: &Path) -> Self {
        Self {
            message: message.into(),
            path: path.to_path_buf(),
        }
    }
}

/// Load and decode a YAML configuration file, then apply defaults.
///
/// The returned value is an untyped document; validation and the typed
/// decode happen afterwards so error reporting can name field paths.
pub fn load_config(path: &Path) -> Result<Value, ConfigParseError> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| ConfigParseError::new("Configuration file not found", path))?;
    if metadata.len() == 0 {
        return Err(ConfigParseError::new("Configuration file is empty", path));
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ConfigParseError::new("Permission denied", path)
        } else {
            ConfigParseError::new(format!("Error reading file: {e}"), path)
        }
    })?;

    if content.trim().is_empty() {
        return Err(ConfigParseError::new("Configuration file is empty", path));
    }

    let decoded: Value = serde_yaml::from_str(&content)
        .map_err(|e| ConfigParseError::new(format!("Invalid YAML syntax: {e}"), path))?;

    // A file with only comments decodes to null.
    if decoded.is_null() {
        return Err(ConfigParseError::new("Configuration file is empty", path));
    }
    if !decoded.is_object() {
        return Err(ConfigParseError::new(
            "Configuration root must be a mapping",
            path,
        ));
    }

    Ok(apply_defaults(decoded))
}

/// Apply default values for missing optional fields.
///
/// Missing top-level keys adopt the default value; for object defaults,
/// missing subkeys adopt the default subvalue, but a provided subtree is
/// not merged any deeper. Idempotent.
pub fn apply_defaults(config: Value) -> Value {
    let mut resolved = config;
    let defaults = crate::config::schema::default_config();
    if let (Some(resolved_map), Some(default_map)) = (resolved.as_object_mut(), defaults.as_object())
    {
        for (key, default_value) in default_map {
            match resolved_map.get_mut(key) {
                None => {
                    resolved_map.insert(key.clone(), default_value.clone());
                }
                Some(existing) => {
                    if let (Some(existing_map), Some(default_sub)) =
                        (existing.as_object_mut(), default_value.as_object())
                    {
                        for (sub_key, sub_value) in default_sub {
                            existing_map
                                .entry(sub_key.clone())
                                .or_insert_with(|| sub_value.clone());
                        }
                    }
                }
            }
        }
    }
    resolved
}

/// Apply CLI overrides to a loaded configuration document.
///
/// Overrides are a flat map of top-level keys; `null` values are ignored
/// so an unset flag never clobbers a configured value.
pub fn apply_overrides(config: Value, overrides: &BTreeMap<String, Value>) -> Value {
    let mut result = config;
    if let Some(map) = result.as_object_mut() {
        for (key, value) in overrides {
            if !value.is_null() {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    result
}

/// List the candidate config files in a directory, non-recursively.
///
/// Only `.yaml`/`.yml` files are considered; symlinks to files are
/// followed; directories carrying a YAML suffix are logged and skipped.
/// The result is sorted for stable output.
pub fn list_config_files(directory: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!(
                "Error accessing config directory '{}': {}",
                directory.display(),
                e
            );
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let has_yaml_ext = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !has_yaml_ext {
            continue;
        }
        // std::fs::metadata follows symlinks, so a symlinked config counts
        // as a file here.
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => files.push(path),
            Ok(meta) if meta.is_dir() => {
                log::warn!(
                    "Ignoring directory '{}' which has a YAML extension",
                    path.display()
                );
            }
            _ => {}
        }
    }
    files.sort();
    files
}

/// Scan a directory for YAML configuration files, load and validate them.
///
/// Invalid or malformed configs are skipped with a warning; overrides are
/// applied before validation so an override URL is subject to the same
/// checks as a configured one.
pub fn scan_config_directory(
    directory: &Path,
    overrides: &BTreeMap<String, Value>,
) -> Vec<SiteConfig> {
    if !directory.exists() {
        if let Err(e) = std::fs::create_dir_all(directory) {
            log::error!(
                "Could not create config directory '{}': {}",
                directory.display(),
                e
            );
            return Vec::new();
        }
        log::info!("Config directory '{}' not found; created.", directory.display());
        log::info!("Startup scan complete: 0 configs loaded, 0 skipped due to errors.");
        return Vec::new();
    }
    if !directory.is_dir() {
        log::warn!("Config path '{}' is not a directory.", directory.display());
        return Vec::new();
    }

    let files = list_config_files(directory);
    if files.is_empty() {
        log::info!("No config files found. Waiting for configs...");
        log::info!("Startup scan complete: 0 configs loaded, 0 skipped due to errors.");
        return Vec::new();
    }

    let mut loaded = Vec::new();
    let mut skipped = 0usize;
    for path in files {
        match load_config(&path) {
            Ok(value) => {
                let value = apply_overrides(value, overrides);
                let validation = validate_config(&value);
                if !validation.is_valid {
                    skipped += 1;
                    log::warn!(
                        "Skipping invalid config '{}': {}",
                        path.display(),
                        validation.error_summary()
                    );
                    continue;
                }
                for warning in &validation.warnings {
                    log::warn!("[{}] {}: {}", path.display(), warning.field_path, warning.message);
                }
                match SiteConfig::from_value(&value) {
                    Ok(config) => loaded.push(config),
                    Err(e) => {
                        skipped += 1;
                        log::error!(
                            "Unexpected error decoding config '{}': {}",
                            path.display(),
                            e
                        );
                    }
                }
            }
            Err(e) => {
                skipped += 1;
                log::warn!("Skipping malformed config '{}': {}", path.display(), e);
            }
        }
    }

    log::info!(
        "Startup scan complete: {} configs loaded, {} skipped due to errors.",
        loaded.len(),
        skipped
    );
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    const MINIMAL_YAML: &str = r#"
version: "1.0"
site_name: books
base_url: "http://example.com/books"
selectors:
  container: "article.book"
  fields:
    title:
      selector: "h2::text"
      kind: css
"#;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "books.yaml", MINIMAL_YAML);
        let value = load_config(&path).unwrap();
        assert_eq!(value["method"], "GET");
        assert_eq!(value["pagination"]["type"], "none");
        assert_eq!(value["rate_limit"]["max_concurrent"], 1);
        assert_eq!(value["priority"], 10);
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn empty_and_comment_only_files_are_parse_errors() {
        let dir = TempDir::new().unwrap();
        let empty = write_file(&dir, "empty.yaml", "");
        assert!(load_config(&empty).unwrap_err().to_string().contains("empty"));

        let blank = write_file(&dir, "blank.yaml", "   \n\t\n");
        assert!(load_config(&blank).unwrap_err().to_string().contains("empty"));

        let comments = write_file(&dir, "comments.yaml", "# just a comment\n");
        assert!(load_config(&comments).unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "bad.yaml", "site_name: [unclosed\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid YAML"));
    }

    #[test]
    fn apply_defaults_is_idempotent() {
        let value: Value = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        let once = apply_defaults(value);
        let twice = apply_defaults(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn defaults_do_not_merge_past_one_level() {
        let value = json!({
            "version": "1.0",
            "site_name": "s",
            "base_url": "http://example.com",
            "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}},
            "pagination": {"type": "url_pattern"}
        });
        let resolved = apply_defaults(value);
        // One level deep: missing subkeys of pagination are filled in.
        assert_eq!(resolved["pagination"]["start"], 1);
        assert_eq!(resolved["pagination"]["max_pages"], 1);
        // The provided type is untouched.
        assert_eq!(resolved["pagination"]["type"], "url_pattern");
    }

    #[test]
    fn overrides_replace_top_level_keys_and_skip_null() {
        let value = json!({"base_url": "http://original", "priority": 10});
        let mut overrides = BTreeMap::new();
        overrides.insert("base_url".to_string(), json!("http://replaced"));
        overrides.insert("priority".to_string(), Value::Null);
        let result = apply_overrides(value, &overrides);
        assert_eq!(result["base_url"], "http://replaced");
        assert_eq!(result["priority"], 10);
    }

    #[test]
    fn scan_skips_invalid_configs() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "good.yaml", MINIMAL_YAML);
        write_file(&dir, "broken.yaml", "site_name: [unclosed\n");
        write_file(&dir, "invalid.yaml", "version: \"1.0\"\nsite_name: x\n");
        write_file(&dir, "notes.txt", "not a config");

        let configs = scan_config_directory(dir.path(), &BTreeMap::new());
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].site_name, "books");
    }

    #[test]
    fn scan_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("configs");
        let configs = scan_config_directory(&missing, &BTreeMap::new());
        assert!(configs.is_empty());
        assert!(missing.is_dir());
    }
}
