//! Backend status reporting for health checks.

use serde::Serialize;

use crate::config::EnvSettings;

/// Which backend the limiters are, or should be, running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Upstash Redis over its REST API
    Upstash,
    /// Process-local window logs
    InMemory,
    /// Production without a distributed store and no opt-in to the fallback
    Misconfigured,
}

impl Provider {
    /// The wire name of this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Upstash => "upstash",
            Provider::InMemory => "in-memory",
            Provider::Misconfigured => "misconfigured",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration status of the rate limiting backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatus {
    /// Distributed store credentials are present and valid
    pub is_configured: bool,
    /// Running in a production environment
    pub is_production: bool,
    /// The effective provider
    pub provider: Provider,
}

impl LimiterStatus {
    /// Derive the status from a snapshot of environment settings.
    pub fn from_settings(settings: &EnvSettings) -> Self {
        let is_configured = settings.upstash_credentials().is_some();
        let is_production = settings.is_production();

        let provider = if is_configured {
            Provider::Upstash
        } else if is_production && !settings.allow_in_memory {
            Provider::Misconfigured
        } else {
            Provider::InMemory
        };

        Self {
            is_configured,
            is_production,
            provider,
        }
    }
}

/// Report the backend status from the current process environment.
///
/// The environment is read on every call so operators and tests observe
/// changes immediately.
pub fn get_status() -> LimiterStatus {
    LimiterStatus::from_settings(&EnvSettings::from_env())
}

/// Serializes tests that read or write the process environment.
#[cfg(test)]
pub(crate) static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
