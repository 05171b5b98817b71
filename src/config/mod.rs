//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (applied by the binary on top of both)
//!
//! Every value is validated by [`Config::validate`] before the proxy starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::{
    CompressionEngine, GateConfig, HttpEngine, LocalEngine, DEFAULT_THRESHOLD,
};
use crate::error::{ProxyError, Result};
use crate::metrics::PricingTable;
use crate::provider::{ProviderDetector, ProviderKind};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener and upstream transport
    #[serde(default)]
    pub server: ServerConfig,

    /// Compression gate and engine
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Session lifetime
    #[serde(default)]
    pub session: SessionConfig,

    /// Upstream base URL per provider
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<ProviderKind, ProviderConfig>,

    /// Input-token pricing rules
    #[serde(default)]
    pub pricing: PricingTable,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            compression: CompressionConfig::default(),
            session: SessionConfig::default(),
            providers: default_providers(),
            pricing: PricingTable::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Default config file location (`<config dir>/ctxproxy/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ctxproxy").join("config.toml"))
    }

    /// Load from `path`, or the default path if it exists, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    tracing::debug!("Loading config from {}", path.display());
                    Self::from_file(path)?
                },
                None => Self::default(),
            },
        };

        base.apply_env(|key| std::env::var(key).ok())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply environment-style overrides read through `var`.
    pub fn apply_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("Invalid value for {key}: {value:?}")))
        }

        // Server settings
        if let Some(host) = var("CTXPROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("CTXPROXY_PORT") {
            self.server.port = parsed("CTXPROXY_PORT", port)?;
        }

        // Compression settings
        if let Some(val) = var("CTXPROXY_THRESHOLD") {
            self.compression.threshold = parsed("CTXPROXY_THRESHOLD", val)?;
        }
        if let Some(val) = var("CTXPROXY_RESULT_LIMIT") {
            self.compression.result_limit = parsed("CTXPROXY_RESULT_LIMIT", val)?;
        }
        if let Some(val) = var("CTXPROXY_MIN_IMPORTANCE") {
            self.compression.min_importance = parsed("CTXPROXY_MIN_IMPORTANCE", val)?;
        }
        if let Some(url) = var("CTXPROXY_ENGINE_URL") {
            self.compression.engine = EngineKind::Http;
            self.compression.engine_url = Some(url);
        }
        if let Some(key) = var("CTXPROXY_ENGINE_API_KEY") {
            self.compression.engine_api_key = Some(key);
        }

        if let Some(val) = var("CTXPROXY_IDLE_TIMEOUT_SECS") {
            self.session.idle_timeout_secs = parsed("CTXPROXY_IDLE_TIMEOUT_SECS", val)?;
        }
        if let Some(level) = var("CTXPROXY_LOG_LEVEL") {
            self.logging.level = level;
        }

        for (provider, key) in [
            (ProviderKind::Anthropic, "ANTHROPIC_BASE_URL"),
            (ProviderKind::OpenAI, "OPENAI_BASE_URL"),
            (ProviderKind::Google, "GOOGLE_BASE_URL"),
        ] {
            if let Some(base_url) = var(key) {
                self.providers.insert(provider, ProviderConfig { base_url });
            }
        }

        Ok(self)
    }

    /// Check every value before the pipeline starts.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ProxyError::Config(msg));

        if self.server.upstream_timeout_secs == 0 {
            return invalid("server.upstream_timeout_secs must be > 0".to_string());
        }
        if self.server.max_body_size == 0 {
            return invalid("server.max_body_size must be > 0".to_string());
        }

        let c = &self.compression;
        if c.threshold == 0 {
            return invalid("compression.threshold must be >= 1".to_string());
        }
        if c.result_limit == 0 {
            return invalid("compression.result_limit must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&c.min_importance) {
            return invalid(format!(
                "compression.min_importance must be within [0, 1], got {}",
                c.min_importance
            ));
        }
        if c.timeout_ms == 0 {
            return invalid("compression.timeout_ms must be > 0".to_string());
        }
        if c.engine == EngineKind::Http {
            match c.engine_url.as_deref() {
                Some(url) => check_url("compression.engine_url", url)?,
                None => {
                    return invalid(
                        "compression.engine = \"http\" requires compression.engine_url"
                            .to_string(),
                    )
                },
            }
        }

        if self.session.idle_timeout_secs == 0 {
            return invalid("session.idle_timeout_secs must be >= 1".to_string());
        }
        if self.session.sweep_interval_secs == 0 {
            return invalid("session.sweep_interval_secs must be >= 1".to_string());
        }

        if self.providers.is_empty() {
            return invalid("at least one provider must be configured".to_string());
        }
        for (provider, cfg) in &self.providers {
            if *provider == ProviderKind::Unknown {
                return invalid("providers.unknown is not a provider".to_string());
            }
            check_url(&format!("providers.{provider}.base_url"), &cfg.base_url)?;
        }

        for rule in self.pricing.rules() {
            if !rule.input_per_million.is_finite() || rule.input_per_million < 0.0 {
                return invalid(format!(
                    "pricing for {:?} must be a non-negative number",
                    rule.model_prefix
                ));
            }
        }

        Ok(())
    }

    /// Gate settings derived from `[compression]`.
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            enabled: self.compression.enabled,
            threshold: self.compression.threshold,
            result_limit: self.compression.result_limit,
            min_importance: self.compression.min_importance,
            timeout: Duration::from_millis(self.compression.timeout_ms),
        }
    }

    /// Build the configured compression engine.
    pub fn build_engine(&self) -> Result<Arc<dyn CompressionEngine>> {
        match self.compression.engine {
            EngineKind::Local => Ok(Arc::new(LocalEngine::new())),
            EngineKind::Http => {
                let url = self.compression.engine_url.as_deref().ok_or_else(|| {
                    ProxyError::Config("compression.engine_url is not set".to_string())
                })?;
                Ok(Arc::new(HttpEngine::new(
                    url,
                    self.compression.engine_api_key.clone(),
                    Duration::from_millis(self.compression.timeout_ms),
                )?))
            },
        }
    }

    /// Copy safe to print: secrets are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.compression.engine_api_key.is_some() {
            config.compression.engine_api_key = Some(REDACTED.to_string());
        }
        config
    }

    /// Detector limited to the configured providers.
    pub fn detector(&self) -> ProviderDetector {
        ProviderDetector::new(self.providers.keys().copied())
    }

    /// Pricing table in effect.
    pub fn pricing_table(&self) -> PricingTable {
        self.pricing.clone()
    }

    /// Upstream base URL for a provider.
    pub fn base_url(&self, provider: ProviderKind) -> Option<&str> {
        self.providers.get(&provider).map(|p| p.base_url.as_str())
    }
}

const REDACTED: &str = "<redacted>";

fn check_url(field: &str, url: &str) -> Result<()> {
    let parsed: http::Uri = url
        .parse()
        .map_err(|e| ProxyError::Config(format!("{field} is not a valid URL: {e}")))?;

    match parsed.scheme_str() {
        Some("http" | "https") if parsed.host().is_some() => Ok(()),
        _ => Err(ProxyError::Config(format!(
            "{field} must be an absolute http(s) URL, got {url:?}"
        ))),
    }
}

/// Listener and upstream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Upstream request timeout in seconds
    pub upstream_timeout_secs: u64,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            upstream_timeout_secs: 300,
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upstream timeout as a duration.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

/// Which compression engine backs the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process importance scoring
    #[default]
    Local,
    /// External service over HTTP
    Http,
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Enable compression (false = passthrough mode)
    pub enabled: bool,

    /// Session message count at which compression starts
    pub threshold: u64,

    /// Maximum messages the engine may return
    pub result_limit: usize,

    /// Minimum importance score for a message to be kept
    pub min_importance: f32,

    /// Deadline for each engine call in milliseconds
    pub timeout_ms: u64,

    /// Engine backend
    pub engine: EngineKind,

    /// Base URL of the external engine
    pub engine_url: Option<String>,

    /// The proxy's own credential for the external engine
    pub engine_api_key: Option<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_THRESHOLD,
            result_limit: 20,
            min_importance: 0.3,
            timeout_ms: 10_000,
            engine: EngineKind::Local,
            engine_url: None,
            engine_api_key: None,
        }
    }
}

/// Session lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is swept
    pub idle_timeout_secs: u64,

    /// Interval between sweeps
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600, // 1 hour
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Upstream endpoint for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, without a trailing path
    pub base_url: String,
}

fn default_providers() -> BTreeMap<ProviderKind, ProviderConfig> {
    [
        (ProviderKind::Anthropic, "https://api.anthropic.com"),
        (ProviderKind::OpenAI, "https://api.openai.com"),
        (
            ProviderKind::Google,
            "https://generativelanguage.googleapis.com",
        ),
    ]
    .into_iter()
    .map(|(kind, url)| {
        (
            kind,
            ProviderConfig {
                base_url: url.to_string(),
            },
        )
    })
    .collect()
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
