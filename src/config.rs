use crate::interceptors::{InterceptorRuleConfig, default_rules};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AZURE_API_VERSION: &str = "2023-05-15";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid type for upstream {name}: {kind}")]
    InvalidUpstreamType { name: String, kind: String },
    #[error("missing URL for Azure upstream {0}")]
    MissingAzureUrl(String),
    #[error("URL should not be provided for OpenAI upstream {0}")]
    UnexpectedOpenAiUrl(String),
    #[error("invalid priority for upstream {name}: {priority}")]
    InvalidPriority { name: String, priority: i64 },
    #[error("duplicate priority for upstream {name}: {priority} (already used by {other})")]
    DuplicatePriority {
        name: String,
        other: String,
        priority: i64,
    },
    #[error("missing api key for upstream {0}")]
    MissingApiKey(String),
    #[error("no upstreams configured")]
    NoUpstreams,
    #[error("no listeners configured")]
    NoListeners,
    #[error("invalid port for listener {interface}:{port}")]
    InvalidPort { interface: String, port: String },
    #[error("use_tls is enabled but {0} is not set")]
    MissingTlsFile(&'static str),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("invalid file settings for log output")]
    InvalidFileSettings,
    #[error("metrics_path must start with '/': {0}")]
    InvalidMetricsPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Azure,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "azure" => Some(Self::Azure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
        }
    }
}

/// A validated upstream. Immutable once the config snapshot is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key: String,
    pub priority: u32,
    pub api_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawUpstream {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, alias = "apiKey")]
    pub api_key: String,
    #[serde(default, alias = "apiVersion")]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub interface: String,
    pub port: String,
}

impl ListenerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub output: LogOutput,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub rotation: LogRotation,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// The config file as written on disk, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub upstreams: BTreeMap<String, RawUpstream>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default, alias = "certFile")]
    pub cert_file: Option<PathBuf>,
    #[serde(default, alias = "keyFile")]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_use_tls", alias = "useTLS")]
    pub use_tls: bool,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default)]
    pub interceptors: Option<Vec<InterceptorRuleConfig>>,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listeners: Option<Vec<ListenerConfig>>,
    pub log_level: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub disable_tls: bool,
}

impl RawConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(listeners) = overrides.listeners {
            self.listeners = listeners;
        }
        if let Some(level) = overrides.log_level {
            self.log.level = level;
        }
        if let Some(cert) = overrides.cert_file {
            self.cert_file = Some(cert);
        }
        if let Some(key) = overrides.key_file {
            self.key_file = Some(key);
        }
        if overrides.disable_tls {
            self.use_tls = false;
        }
    }

    pub fn validate(self) -> Result<GatewayConfig, ConfigError> {
        let upstreams = validate_upstreams(&self.upstreams)?;

        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        for listener in &self.listeners {
            if listener.port.parse::<u16>().is_err() {
                return Err(ConfigError::InvalidPort {
                    interface: listener.interface.clone(),
                    port: listener.port.clone(),
                });
            }
        }

        let tls = if self.use_tls {
            let cert_file = self
                .cert_file
                .ok_or(ConfigError::MissingTlsFile("cert_file"))?;
            let key_file = self.key_file.ok_or(ConfigError::MissingTlsFile("key_file"))?;
            Some(TlsConfig {
                cert_file,
                key_file,
            })
        } else {
            None
        };

        validate_log(&self.log)?;
        if !self.metrics_path.starts_with('/') || self.metrics_path.len() < 2 {
            return Err(ConfigError::InvalidMetricsPath(self.metrics_path));
        }

        Ok(GatewayConfig {
            upstreams,
            listeners: self.listeners,
            log: self.log,
            tls,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs.max(1)),
            openai_base_url: self.openai_base_url,
            max_body_bytes: self.max_body_bytes,
            metrics_path: self.metrics_path,
            interceptors: self.interceptors.unwrap_or_else(default_rules),
        })
    }
}

/// Read-only configuration snapshot shared by every request.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstreams: HashMap<String, ProviderConfig>,
    pub listeners: Vec<ListenerConfig>,
    pub log: LogConfig,
    pub tls: Option<TlsConfig>,
    pub connection_timeout: Duration,
    pub openai_base_url: String,
    pub max_body_bytes: usize,
    pub metrics_path: String,
    pub interceptors: Vec<InterceptorRuleConfig>,
}

impl GatewayConfig {
    pub fn load(path: &Path, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut raw = RawConfig::from_toml(&text)?;
        raw.apply_overrides(overrides);
        raw.validate()
    }
}

fn validate_upstreams(
    raw: &BTreeMap<String, RawUpstream>,
) -> Result<HashMap<String, ProviderConfig>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::NoUpstreams);
    }
    let mut priorities: HashMap<i64, &str> = HashMap::new();
    let mut out = HashMap::with_capacity(raw.len());
    for (name, upstream) in raw {
        let kind = ProviderKind::parse(&upstream.kind).ok_or_else(|| {
            ConfigError::InvalidUpstreamType {
                name: name.clone(),
                kind: upstream.kind.clone(),
            }
        })?;
        let url = upstream
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        match (kind, url) {
            (ProviderKind::Azure, None) => return Err(ConfigError::MissingAzureUrl(name.clone())),
            (ProviderKind::OpenAi, Some(_)) => {
                return Err(ConfigError::UnexpectedOpenAiUrl(name.clone()));
            }
            _ => {}
        }
        if upstream.priority <= 0 || upstream.priority > i64::from(u32::MAX) {
            return Err(ConfigError::InvalidPriority {
                name: name.clone(),
                priority: upstream.priority,
            });
        }
        if let Some(other) = priorities.insert(upstream.priority, name) {
            return Err(ConfigError::DuplicatePriority {
                name: name.clone(),
                other: other.to_string(),
                priority: upstream.priority,
            });
        }
        if upstream.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey(name.clone()));
        }
        out.insert(
            name.clone(),
            ProviderConfig {
                name: name.clone(),
                kind,
                endpoint: url.map(str::to_string),
                model: upstream.model.clone(),
                api_key: upstream.api_key.clone(),
                priority: upstream.priority as u32,
                api_version: upstream
                    .api_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            },
        );
    }
    Ok(out)
}

fn validate_log(log: &LogConfig) -> Result<(), ConfigError> {
    if log.level.parse::<tracing::Level>().is_err() {
        return Err(ConfigError::InvalidLogLevel(log.level.clone()));
    }
    if log.output == LogOutput::File && (log.file_path.is_none() || log.max_files == 0) {
        return Err(ConfigError::InvalidFileSettings);
    }
    Ok(())
}

/// Parses `iface:port,iface:port`. Entries without exactly one `:` are
/// returned separately so the caller can report them once logging is up.
pub fn parse_listeners(raw: &str) -> (Vec<ListenerConfig>, Vec<String>) {
    let mut listeners = Vec::new();
    let mut skipped = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 2 {
            skipped.push(entry.to_string());
            continue;
        }
        listeners.push(ListenerConfig {
            interface: parts[0].to_string(),
            port: parts[1].to_string(),
        });
    }
    (listeners, skipped)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_files() -> usize {
    7
}

fn default_use_tls() -> bool {
    true
}

fn default_connection_timeout_secs() -> u64 {
    300
}

fn default_openai_base_url() -> String {
    DEFAULT_OPENAI_BASE_URL.to_string()
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
