use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub integrations: IntegrationsConfig,
    pub flows: FlowsConfig,
    pub escalation: EscalationConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IntegrationsConfig {
    pub mode: IntegrationMode,
    pub timeout_secs: u64,
    pub read_retries: u32,
    pub catalogue_url: Option<String>,
    pub underwriting_url: Option<String>,
    pub payment_url: Option<String>,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct FlowsConfig {
    /// External flow registry; the built-in definitions are used when unset.
    pub definitions_path: Option<PathBuf>,
    pub failure_threshold: u32,
    pub ambiguity_margin: u32,
    pub human_request_phrases: Vec<String>,
    pub exit_phrases: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    pub queue_enabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ApiConfig {
    pub api_keys: Vec<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    Mock,
    Real,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub integration_mode: Option<IntegrationMode>,
    pub flows_definitions_path: Option<PathBuf>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

const DEFAULT_HUMAN_REQUEST_PHRASES: &[&str] =
    &["human", "agent", "real person", "talk to someone", "speak to someone", "customer care"];
const DEFAULT_EXIT_PHRASES: &[&str] =
    &["exit", "cancel", "cancel application", "stop", "start over", "nevermind", "quit"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://insureflow.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            integrations: IntegrationsConfig {
                mode: IntegrationMode::Mock,
                timeout_secs: 10,
                read_retries: 2,
                catalogue_url: None,
                underwriting_url: None,
                payment_url: None,
                api_key: None,
            },
            flows: FlowsConfig {
                definitions_path: None,
                failure_threshold: 2,
                ambiguity_margin: 0,
                human_request_phrases: DEFAULT_HUMAN_REQUEST_PHRASES
                    .iter()
                    .map(|phrase| phrase.to_string())
                    .collect(),
                exit_phrases: DEFAULT_EXIT_PHRASES.iter().map(|phrase| phrase.to_string()).collect(),
            },
            escalation: EscalationConfig { queue_enabled: true },
            api: ApiConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for IntegrationMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "real" => Ok(Self::Real),
            other => Err(ConfigError::Validation(format!(
                "unsupported integrations mode `{other}` (expected mock|real)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("insureflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(integrations) = patch.integrations {
            if let Some(mode) = integrations.mode {
                self.integrations.mode = mode;
            }
            if let Some(timeout_secs) = integrations.timeout_secs {
                self.integrations.timeout_secs = timeout_secs;
            }
            if let Some(read_retries) = integrations.read_retries {
                self.integrations.read_retries = read_retries;
            }
            if let Some(catalogue_url) = integrations.catalogue_url {
                self.integrations.catalogue_url = Some(catalogue_url);
            }
            if let Some(underwriting_url) = integrations.underwriting_url {
                self.integrations.underwriting_url = Some(underwriting_url);
            }
            if let Some(payment_url) = integrations.payment_url {
                self.integrations.payment_url = Some(payment_url);
            }
            if let Some(api_key) = integrations.api_key {
                self.integrations.api_key = Some(secret_value(api_key));
            }
        }

        if let Some(flows) = patch.flows {
            if let Some(definitions_path) = flows.definitions_path {
                self.flows.definitions_path = Some(definitions_path);
            }
            if let Some(failure_threshold) = flows.failure_threshold {
                self.flows.failure_threshold = failure_threshold;
            }
            if let Some(ambiguity_margin) = flows.ambiguity_margin {
                self.flows.ambiguity_margin = ambiguity_margin;
            }
            if let Some(phrases) = flows.human_request_phrases {
                self.flows.human_request_phrases = phrases;
            }
            if let Some(phrases) = flows.exit_phrases {
                self.flows.exit_phrases = phrases;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(queue_enabled) = escalation.queue_enabled {
                self.escalation.queue_enabled = queue_enabled;
            }
        }

        if let Some(api) = patch.api {
            if let Some(api_keys) = api.api_keys {
                self.api.api_keys = api_keys.into_iter().map(secret_value).collect();
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("INSUREFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("INSUREFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("INSUREFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("INSUREFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("INSUREFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("INSUREFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("INSUREFLOW_SERVER_PORT") {
            self.server.port = parse_u16("INSUREFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("INSUREFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("INSUREFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_MODE") {
            self.integrations.mode = value.parse()?;
        }
        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_TIMEOUT_SECS") {
            self.integrations.timeout_secs =
                parse_u64("INSUREFLOW_INTEGRATIONS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_READ_RETRIES") {
            self.integrations.read_retries =
                parse_u32("INSUREFLOW_INTEGRATIONS_READ_RETRIES", &value)?;
        }
        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_CATALOGUE_URL") {
            self.integrations.catalogue_url = Some(value);
        }
        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_UNDERWRITING_URL") {
            self.integrations.underwriting_url = Some(value);
        }
        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_PAYMENT_URL") {
            self.integrations.payment_url = Some(value);
        }
        if let Some(value) = read_env("INSUREFLOW_INTEGRATIONS_API_KEY") {
            self.integrations.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("INSUREFLOW_FLOWS_DEFINITIONS_PATH") {
            self.flows.definitions_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("INSUREFLOW_FLOWS_FAILURE_THRESHOLD") {
            self.flows.failure_threshold = parse_u32("INSUREFLOW_FLOWS_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("INSUREFLOW_FLOWS_AMBIGUITY_MARGIN") {
            self.flows.ambiguity_margin = parse_u32("INSUREFLOW_FLOWS_AMBIGUITY_MARGIN", &value)?;
        }

        if let Some(value) = read_env("INSUREFLOW_ESCALATION_QUEUE_ENABLED") {
            self.escalation.queue_enabled =
                parse_bool("INSUREFLOW_ESCALATION_QUEUE_ENABLED", &value)?;
        }

        if let Some(value) = read_env("INSUREFLOW_API_KEYS") {
            self.api.api_keys = value
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| secret_value(key.to_string()))
                .collect();
        }

        let log_level =
            read_env("INSUREFLOW_LOGGING_LEVEL").or_else(|| read_env("INSUREFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("INSUREFLOW_LOGGING_FORMAT").or_else(|| read_env("INSUREFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(mode) = overrides.integration_mode {
            self.integrations.mode = mode;
        }
        if let Some(path) = overrides.flows_definitions_path {
            self.flows.definitions_path = Some(path);
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_integrations(&self.integrations)?;
        validate_flows(&self.flows)?;
        validate_api(&self.api)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("insureflow.toml"), PathBuf::from("config/insureflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_integrations(integrations: &IntegrationsConfig) -> Result<(), ConfigError> {
    if integrations.timeout_secs == 0 || integrations.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "integrations.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if integrations.read_retries > 5 {
        return Err(ConfigError::Validation(
            "integrations.read_retries must be at most 5".to_string(),
        ));
    }

    let urls = [
        ("integrations.catalogue_url", &integrations.catalogue_url),
        ("integrations.underwriting_url", &integrations.underwriting_url),
        ("integrations.payment_url", &integrations.payment_url),
    ];
    for (key, value) in urls {
        match value {
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                return Err(ConfigError::Validation(format!(
                    "{key} must start with http:// or https://"
                )));
            }
            None if integrations.mode == IntegrationMode::Real => {
                return Err(ConfigError::Validation(format!(
                    "{key} is required when integrations.mode is `real`"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

fn validate_flows(flows: &FlowsConfig) -> Result<(), ConfigError> {
    if flows.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "flows.failure_threshold must be greater than zero".to_string(),
        ));
    }

    let blank_phrase = flows
        .human_request_phrases
        .iter()
        .chain(flows.exit_phrases.iter())
        .any(|phrase| phrase.trim().is_empty());
    if blank_phrase {
        return Err(ConfigError::Validation(
            "flows.human_request_phrases and flows.exit_phrases must not contain blank entries"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_api(api: &ApiConfig) -> Result<(), ConfigError> {
    if api.api_keys.iter().any(|key| key.expose_secret().trim().is_empty()) {
        return Err(ConfigError::Validation("api.api_keys must not contain blank keys".to_string()));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    integrations: Option<IntegrationsPatch>,
    flows: Option<FlowsPatch>,
    escalation: Option<EscalationPatch>,
    api: Option<ApiPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IntegrationsPatch {
    mode: Option<IntegrationMode>,
    timeout_secs: Option<u64>,
    read_retries: Option<u32>,
    catalogue_url: Option<String>,
    underwriting_url: Option<String>,
    payment_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FlowsPatch {
    definitions_path: Option<PathBuf>,
    failure_threshold: Option<u32>,
    ambiguity_margin: Option<u32>,
    human_request_phrases: Option<Vec<String>>,
    exit_phrases: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    queue_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPatch {
    api_keys: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
