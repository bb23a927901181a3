use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use expensa_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// Effective configuration, one line per field, each tagged with where its
/// value came from.
pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, file_doc.as_ref(), file_path.as_deref())
    };

    let fields = [
        (
            "database.url",
            config.database.url.clone(),
            source("database.url", &["EXPENSA_DATABASE_URL"]),
        ),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            source("database.max_connections", &["EXPENSA_DATABASE_MAX_CONNECTIONS"]),
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            source("database.timeout_secs", &["EXPENSA_DATABASE_TIMEOUT_SECS"]),
        ),
        (
            "rules.unparsable_condition",
            format!("{:?}", config.rules.unparsable_condition),
            source("rules.unparsable_condition", &["EXPENSA_RULES_UNPARSABLE_CONDITION"]),
        ),
        (
            "workflow.max_conflict_retries",
            config.workflow.max_conflict_retries.to_string(),
            source("workflow.max_conflict_retries", &["EXPENSA_WORKFLOW_MAX_CONFLICT_RETRIES"]),
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            source("logging.level", &["EXPENSA_LOGGING_LEVEL", "EXPENSA_LOG_LEVEL"]),
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            source("logging.format", &["EXPENSA_LOGGING_FORMAT", "EXPENSA_LOG_FORMAT"]),
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.iter().map(|(key, value, source)| render_line(key, value, source)));
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("expensa.toml"), PathBuf::from("config/expensa.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: &str) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use super::{contains_path, field_source};

    #[test]
    fn file_source_is_reported_for_present_keys() {
        let doc: toml::Value = "[workflow]\nmax_conflict_retries = 5\n".parse().expect("toml");

        assert!(contains_path(&doc, "workflow.max_conflict_retries"));
        assert!(!contains_path(&doc, "workflow.other"));
        assert_eq!(
            field_source(
                "workflow.max_conflict_retries",
                &["EXPENSA_TEST_UNSET_KEY"],
                Some(&doc),
                Some(std::path::Path::new("expensa.toml")),
            ),
            "file (expensa.toml)"
        );
        assert_eq!(
            field_source("logging.level", &["EXPENSA_TEST_UNSET_KEY"], Some(&doc), None),
            "default"
        );
    }
}
