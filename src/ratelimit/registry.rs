//! Named limiter registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{EnvSettings, ServiceConfig};
use crate::error::{RatewardenError, Result};

use super::backend::WindowStore;
use super::clock::Clock;
use super::distributed::UpstashStore;
use super::identity::Identifier;
use super::limiter::{Decision, RateLimiter};
use super::local::LocalStore;
use super::status::{get_status, LimiterStatus, Provider};

/// Holds the named limiters of one process.
///
/// The backend is chosen once, when the registry is built. Each limiter gets
/// its own store instance.
#[derive(Debug)]
pub struct LimiterRegistry {
    /// Limiters by name
    limiters: BTreeMap<String, RateLimiter>,
    /// Backend chosen at construction
    provider: Provider,
}

impl LimiterRegistry {
    /// Build every configured limiter on the backend the environment selects.
    ///
    /// Valid Upstash credentials select the distributed store; otherwise all
    /// limiters run in memory. Falling back in production is logged as a
    /// warning but does not fail.
    pub fn from_config(
        config: &ServiceConfig,
        env: &EnvSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let credentials = env.upstash_credentials();

        let client = match credentials {
            Some(_) => Some(
                reqwest::Client::builder()
                    .timeout(config.store.timeout())
                    .build()?,
            ),
            None => None,
        };

        match &credentials {
            Some(creds) => info!(url = %creds.url, "Using Upstash window store"),
            None if env.is_production() && !env.allow_in_memory => warn!(
                "Upstash not configured in production; falling back to in-memory window store, \
                 limits will not be shared between instances"
            ),
            None if env.is_production() => {
                info!("Using in-memory window store in production by explicit opt-in")
            }
            None => info!("Using in-memory window store (Upstash not configured)"),
        }

        let mut limiters = BTreeMap::new();
        for (name, settings) in &config.limiters {
            let limiter_config = settings.to_config()?;

            let store: Box<dyn WindowStore> = match (&credentials, &client) {
                (Some(creds), Some(client)) => Box::new(UpstashStore::with_client(
                    client.clone(),
                    creds,
                    config.store.timeout(),
                )),
                _ => Box::new(LocalStore::new()),
            };

            let limiter = RateLimiter::new(name.clone(), limiter_config, store, clock.clone())
                .with_key_prefix(config.store.key_prefix.clone())
                .with_failure_policy(config.store.failure_policy);

            debug!(
                limiter = %name,
                limit = settings.limit,
                window_secs = settings.window_secs,
                "Registered limiter"
            );
            limiters.insert(name.clone(), limiter);
        }

        let provider = if credentials.is_some() {
            Provider::Upstash
        } else {
            Provider::InMemory
        };

        Ok(Self { limiters, provider })
    }

    /// Build a registry from already constructed limiters.
    pub fn from_limiters(limiters: impl IntoIterator<Item = RateLimiter>) -> Self {
        let limiters: BTreeMap<String, RateLimiter> = limiters
            .into_iter()
            .map(|limiter| (limiter.name().to_string(), limiter))
            .collect();

        let provider = if limiters
            .values()
            .any(|limiter| limiter.provider() == Provider::Upstash)
        {
            Provider::Upstash
        } else {
            Provider::InMemory
        };

        Self { limiters, provider }
    }

    /// Check and record one request against the named limiter.
    pub async fn check_limit(&self, name: &str, identifier: &Identifier) -> Result<Decision> {
        let limiter = self
            .get(name)
            .ok_or_else(|| RatewardenError::UnknownLimiter(name.to_string()))?;
        Ok(limiter.check(identifier).await)
    }

    /// Get a limiter by name.
    pub fn get(&self, name: &str) -> Option<&RateLimiter> {
        self.limiters.get(name)
    }

    /// Names of all limiters, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// Get the number of limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether the registry holds no limiters.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// The backend chosen at construction.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// The backend status as the current environment describes it.
    ///
    /// Recomputed on every call, independent of the backend in use.
    pub fn status(&self) -> LimiterStatus {
        get_status()
    }

    /// Sweep stale records from every limiter's store.
    pub fn sweep(&self) -> usize {
        self.limiters.values().map(RateLimiter::sweep).sum()
    }

    /// Sweep on a fixed interval until the returned handle is shut down or dropped.
    ///
    /// A zero interval disables sweeping.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        if interval.is_zero() {
            warn!("Sweep interval is zero; stale in-memory records will not be swept");
            return SweeperHandle { task: None };
        }

        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = registry.sweep();
                if removed > 0 {
                    debug!(removed = removed, "Sweeper removed stale records");
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "Started window record sweeper");
        SweeperHandle { task: Some(task) }
    }
}

/// Handle to the background sweep task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Whether a sweep task was started.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("Stopped window record sweeper");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
