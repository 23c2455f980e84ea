use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use insureflow_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value) in effective_values(&config) {
        let env_key = env_key_for(key_path);
        lines.push(render_line(
            key_path,
            &value,
            field_source(
                key_path,
                Some(&env_key),
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        ));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "<unset>".to_string());
    let integration_key = match &config.integrations.api_key {
        Some(key) => redact_token(key.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("integrations.mode", format!("{:?}", config.integrations.mode).to_lowercase()),
        ("integrations.timeout_secs", config.integrations.timeout_secs.to_string()),
        ("integrations.read_retries", config.integrations.read_retries.to_string()),
        ("integrations.catalogue_url", optional(&config.integrations.catalogue_url)),
        ("integrations.underwriting_url", optional(&config.integrations.underwriting_url)),
        ("integrations.payment_url", optional(&config.integrations.payment_url)),
        ("integrations.api_key", integration_key),
        (
            "flows.definitions_path",
            config
                .flows
                .definitions_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<builtin>".to_string()),
        ),
        ("flows.failure_threshold", config.flows.failure_threshold.to_string()),
        ("flows.ambiguity_margin", config.flows.ambiguity_margin.to_string()),
        ("escalation.queue_enabled", config.escalation.queue_enabled.to_string()),
        ("api.api_keys", format!("<{} key(s) redacted>", config.api.api_keys.len())),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format).to_lowercase()),
    ]
}

fn env_key_for(key_path: &str) -> String {
    if key_path == "api.api_keys" {
        return "INSUREFLOW_API_KEYS".to_string();
    }
    format!("INSUREFLOW_{}", key_path.replace('.', "_").to_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("insureflow.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/insureflow.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
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

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
