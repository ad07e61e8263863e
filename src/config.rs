//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::{FailurePolicy, LimiterConfig};

/// Upstash REST endpoint.
pub const UPSTASH_URL_VAR: &str = "UPSTASH_REDIS_REST_URL";
/// Upstash REST bearer token.
pub const UPSTASH_TOKEN_VAR: &str = "UPSTASH_REDIS_REST_TOKEN";
/// Deployment environment; `production` marks production.
pub const ENVIRONMENT_VAR: &str = "RATEWARDEN_ENV";
/// Lets production run on the in-memory store without being reported as misconfigured.
pub const ALLOW_IN_MEMORY_VAR: &str = "RATEWARDEN_ALLOW_IN_MEMORY";

/// Prefix for layered overrides, e.g. `RATEWARDEN__SERVER__HTTP_ADDR`.
const OVERRIDE_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limiters and their quotas
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterSettings>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            limiters: default_limiters(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// How often stale in-memory records are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ServerConfig {
    /// Get the sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_sweep_interval() -> u64 {
    60
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix of every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for each distributed store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Decision to take when the distributed store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Get the distributed store timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Quota for one named limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum requests per window
    pub limit: u32,

    /// Window width in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl LimiterSettings {
    /// Create limiter settings.
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// Convert to a validated limiter configuration.
    pub fn to_config(&self) -> Result<LimiterConfig> {
        LimiterConfig::new(self.limit, Duration::from_secs(self.window_secs))
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_limiters() -> BTreeMap<String, LimiterSettings> {
    BTreeMap::from([
        ("ai".to_string(), LimiterSettings::new(20, 60)),
        ("upload".to_string(), LimiterSettings::new(10, 60)),
    ])
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file, layered under
    /// `RATEWARDEN__*` overrides and then per-limiter environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(OVERRIDE_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatewardenError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `<NAME>_RATE_LIMIT` and `<NAME>_RATE_WINDOW_SECONDS` from the
    /// process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_with(|name| std::env::var(name).ok());
    }

    /// Apply per-limiter overrides from an arbitrary variable lookup.
    ///
    /// Values that are not integers of at least 1 are ignored.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, settings) in self.limiters.iter_mut() {
            let var_prefix = name.to_ascii_uppercase().replace('-', "_");

            if let Some(limit) = parse_positive(&lookup, &format!("{var_prefix}_RATE_LIMIT")) {
                settings.limit = u32::try_from(limit).unwrap_or(u32::MAX);
            }
            if let Some(secs) =
                parse_positive(&lookup, &format!("{var_prefix}_RATE_WINDOW_SECONDS"))
            {
                settings.window_secs = secs;
            }
        }
    }

    /// Reject settings the limiters cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiters.is_empty() {
            return Err(RatewardenError::Config(
                "at least one limiter must be configured".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(RatewardenError::Config(
                "store.timeout_ms must be at least 1".to_string(),
            ));
        }
        for (name, settings) in &self.limiters {
            if let Err(err) = settings.to_config() {
                let reason = match err {
                    RatewardenError::Config(reason) => reason,
                    other => other.to_string(),
                };
                return Err(RatewardenError::Config(format!(
                    "limiter '{}': {}",
                    name, reason
                )));
            }
        }
        Ok(())
    }
}

fn parse_positive<F>(lookup: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value >= 1)
}

/// Credentials for the Upstash REST API.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstashCredentials {
    /// REST endpoint URL
    pub url: String,
    /// Bearer token
    pub token: String,
}

impl std::fmt::Debug for UpstashCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstashCredentials")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Backend-relevant settings read from the environment.
///
/// This is a snapshot; call [`EnvSettings::from_env`] again to observe changes.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    /// Upstash REST URL, if set
    pub upstash_url: Option<String>,
    /// Upstash REST token, if set
    pub upstash_token: Option<String>,
    /// Deployment environment name, if set
    pub environment: Option<String>,
    /// Production explicitly accepts the in-memory store
    pub allow_in_memory: bool,
}

impl EnvSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            upstash_url: non_blank(UPSTASH_URL_VAR),
            upstash_token: non_blank(UPSTASH_TOKEN_VAR),
            environment: non_blank(ENVIRONMENT_VAR),
            allow_in_memory: non_blank(ALLOW_IN_MEMORY_VAR)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }

    /// Whether this is a production environment.
    pub fn is_production(&self) -> bool {
        self.environment
            .as_deref()
            .is_some_and(|env| env.trim().eq_ignore_ascii_case("production"))
    }

    /// Valid Upstash credentials, if both are present.
    ///
    /// The URL must parse with an `http` or `https` scheme.
    pub fn upstash_credentials(&self) -> Option<UpstashCredentials> {
        let url = self.upstash_url.as_deref()?.trim();
        let token = self.upstash_token.as_deref()?.trim();

        let parsed = reqwest::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return None;
        }

        Some(UpstashCredentials {
            url: url.to_string(),
            token: token.to_string(),
        })
    }
}
