use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("adapter #{index} has an empty name")]
    EmptyAdapterName { index: usize },
    #[error("adapter '{0}' is configured more than once")]
    DuplicateAdapter(String),
    #[error("adapter '{0}' has an empty api key")]
    EmptyApiKey(String),
    #[error("adapter '{0}' has an api key that cannot be sent as a header value")]
    InvalidApiKey(String),
    #[error("adapter '{name}' has an invalid upstream url: {reason}")]
    InvalidUpstreamUrl { name: String, reason: String },
    #[error("invalid rate limit window for {scope}: {reason}")]
    InvalidWindow { scope: String, reason: String },
    #[error("invalid trusted proxy '{0}', expected an ip address or cidr")]
    InvalidTrustedProxy(String),
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    #[error("invalid allowed origin '{0}'")]
    InvalidOrigin(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("invalid metrics path '{path}': {reason}")]
    InvalidMetricsPath { path: String, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Self::Development,
            _ => Self::Production,
        }
    }

    pub fn exposes_error_detail(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Paths the gateway serves itself. Everything else is proxied.
pub const HEALTH_PATH: &str = "/health";
pub const READY_PATH: &str = "/ready";
pub const ADAPTERS_PATH: &str = "/api/adapters";
pub const BUILTIN_PATHS: &[&str] = &[HEALTH_PATH, READY_PATH, ADAPTERS_PATH];

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub config_path: Option<PathBuf>,
    pub adapters_json: Option<String>,
    pub environment: Environment,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("CHATGATE_LISTEN").unwrap_or_else(|| "0.0.0.0:3001".to_string());
        let metrics_path =
            env_non_empty("CHATGATE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let config_path = env_non_empty("CHATGATE_CONFIG").map(PathBuf::from);
        let adapters_json = env_non_empty("CHATGATE_ADAPTERS");
        let environment = env_non_empty("CHATGATE_ENV")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Production);
        Self {
            listen,
            metrics_path,
            config_path,
            adapters_json,
            environment,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason| ConfigError::InvalidMetricsPath {
            path: self.metrics_path.clone(),
            reason,
        };
        let path = self.metrics_path.as_str();
        if !path.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        if path.contains(['{', '}', '*', '?', '#']) {
            return Err(invalid("must be a literal path"));
        }
        if BUILTIN_PATHS.contains(&path) {
            return Err(invalid("collides with a built-in route"));
        }
        Ok(())
    }

    /// Resolve the gateway document from the configured sources. Inline
    /// adapters replace the file's adapter list wholesale.
    pub fn load_gateway_config(&self) -> Result<GatewayConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => GatewayConfig::from_file(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(raw) = &self.adapters_json {
            config.adapters =
                serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                    origin: "CHATGATE_ADAPTERS".to_string(),
                    source,
                })?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })
    }

    /// Checks the settings that do not depend on the adapter table. Adapter
    /// entries are validated when the table is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.window().validate("rate_limit")?;
        for adapter in &self.adapters {
            if let Some(window) = &adapter.rate_limit {
                window.validate(&format!("adapter '{}'", adapter.name))?;
            }
        }
        for proxy in &self.rate_limit.trusted_proxies {
            parse_trusted_proxy(proxy)?;
        }
        for origin in &self.cors.allowed_origins {
            if origin.trim().is_empty() {
                return Err(ConfigError::InvalidOrigin(origin.clone()));
            }
        }
        for name in [&self.proxy.adapter_header, &self.proxy.auth_header] {
            axum::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeaderName(name.clone()))?;
        }
        if self.proxy.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("proxy.request_timeout_ms"));
        }
        if self.proxy.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("proxy.connect_timeout_ms"));
        }
        if self.shutdown.grace_period_ms == 0 {
            return Err(ConfigError::ZeroDuration("shutdown.grace_period_ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    pub name: String,
    #[serde(alias = "apiKey")]
    pub api_key: String,
    #[serde(alias = "apiUrl", alias = "upstream_base_url")]
    pub upstream_url: String,
    #[serde(default)]
    pub rate_limit: Option<WindowConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl WindowConfig {
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidWindow {
                scope: scope.to_string(),
                reason: "max_requests must be positive".to_string(),
            });
        }
        if self.window_ms == 0 {
            return Err(ConfigError::InvalidWindow {
                scope: scope.to_string(),
                reason: "window_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_credentials: bool,
    #[serde(default = "default_cors_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            allow_credentials: true,
            max_age_secs: default_cors_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeyKind {
    Adapter,
    Ip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_key")]
    pub key: RateLimitKeyKind,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub trust_proxy_headers: bool,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl RateLimitConfig {
    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            max_requests: self.max_requests,
            window_ms: self.window_ms,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key: default_rate_limit_key(),
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            trust_proxy_headers: false,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_adapter_header")]
    pub adapter_header: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `None` when streams may stay idle indefinitely.
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_ms > 0).then(|| Duration::from_millis(self.stream_idle_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            adapter_header: default_adapter_header(),
            auth_header: default_auth_header(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_request_body_bytes: default_max_request_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

pub fn parse_trusted_proxy(raw: &str) -> Result<ipnet::IpNet, ConfigError> {
    let trimmed = raw.trim();
    if let Ok(net) = trimmed.parse::<ipnet::IpNet>() {
        return Ok(net);
    }
    trimmed
        .parse::<std::net::IpAddr>()
        .map(ipnet::IpNet::from)
        .map_err(|_| ConfigError::InvalidTrustedProxy(raw.to_string()))
}

fn default_true() -> bool {
    true
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_max_age_secs() -> u64 {
    86_400
}

fn default_rate_limit_key() -> RateLimitKeyKind {
    RateLimitKeyKind::Adapter
}

fn default_max_requests() -> u32 {
    60
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_adapter_header() -> String {
    "X-Adapter-Name".to_string()
}

fn default_auth_header() -> String {
    "X-API-Key".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    300_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_request_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    16
}

fn default_grace_period_ms() -> u64 {
    30_000
}
