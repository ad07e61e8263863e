//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::WindowStore;
use super::clock::Clock;
use super::identity::Identifier;
use super::status::Provider;
use super::window::{LimiterConfig, WindowOutcome};

/// What to do when the window store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The configured limit
    pub limit: u32,
    /// Admissions left in the current window
    pub remaining: u32,
    /// When the caller regains quota, in epoch milliseconds
    pub reset_at_epoch_ms: u64,
}

impl Decision {
    /// Time from `now_ms` until the reset, rounded up to whole seconds.
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        let wait_ms = self.reset_at_epoch_ms.saturating_sub(now_ms);
        Duration::from_secs(wait_ms.div_ceil(1000))
    }
}

/// A named sliding-window log limiter.
///
/// Each limiter exclusively owns its window store.
pub struct RateLimiter {
    /// Limiter name, also part of every store key
    name: String,
    /// Quota settings
    config: LimiterConfig,
    /// Prefix for store keys
    key_prefix: String,
    /// Window state
    store: Box<dyn WindowStore>,
    /// Time source
    clock: Arc<dyn Clock>,
    /// Behaviour when the store fails
    failure_policy: FailurePolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("provider", &self.store.provider())
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter over the given store.
    pub fn new(
        name: impl Into<String>,
        config: LimiterConfig,
        store: Box<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            key_prefix: "ratelimit".to_string(),
            store,
            clock,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Set the prefix used for store keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the behaviour when the store fails.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Get the limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the quota settings.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Get the failure policy.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Get the provider of the owned store.
    pub fn provider(&self) -> Provider {
        self.store.provider()
    }

    /// The store key for an identifier: `prefix:name:identifier`.
    pub fn store_key(&self, identifier: &Identifier) -> String {
        format!("{}:{}:{}", self.key_prefix, self.name, identifier)
    }

    /// Check and record one request for `identifier`.
    ///
    /// Denied requests do not consume quota. Store failures never surface;
    /// the failure policy picks the decision and the failure is logged.
    pub async fn check(&self, identifier: &Identifier) -> Decision {
        let now = self.clock.now_ms();
        let key = self.store_key(identifier);

        trace!(limiter = %self.name, identifier = %identifier, "Checking rate limit");

        match self.store.hit(&key, now, &self.config).await {
            Ok(outcome) => {
                let decision = self.decide(outcome, now);
                if !decision.allowed {
                    debug!(
                        limiter = %self.name,
                        identifier = %identifier,
                        reset_at = decision.reset_at_epoch_ms,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => {
                warn!(
                    limiter = %self.name,
                    identifier = %identifier,
                    policy = ?self.failure_policy,
                    error = %err,
                    "Window store unavailable, applying failure policy"
                );
                self.on_store_failure(now)
            }
        }
    }

    /// Drop stale records from the owned store.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_ms(), &self.config)
    }

    fn decide(&self, outcome: WindowOutcome, now: u64) -> Decision {
        let limit = self.config.limit();
        let window = self.config.window_ms();

        if outcome.admitted {
            Decision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(outcome.count),
                reset_at_epoch_ms: now.saturating_add(window),
            }
        } else {
            Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_epoch_ms: outcome.oldest_ms.unwrap_or(now).saturating_add(window),
            }
        }
    }

    fn on_store_failure(&self, now: u64) -> Decision {
        let limit = self.config.limit();
        let reset_at_epoch_ms = now.saturating_add(self.config.window_ms());

        match self.failure_policy {
            FailurePolicy::Open => Decision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at_epoch_ms,
            },
            FailurePolicy::Closed => Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_epoch_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::local::LocalStore;
    use crate::ratelimit::window::MAX_WINDOW_MS;
    use async_trait::async_trait;

    const START: u64 = 1_700_000_000_000;

    struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn hit(
            &self,
            _key: &str,
            _now_ms: u64,
            _config: &LimiterConfig,
        ) -> Result<WindowOutcome, StoreError> {
            Err(StoreError::Timeout(1_000))
        }

        fn provider(&self) -> Provider {
            Provider::Upstash
        }
    }

    fn local_limiter(limit: u32, window: Duration) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = RateLimiter::new(
            "test",
            LimiterConfig::new(limit, window).unwrap(),
            Box::new(LocalStore::new()),
            clock.clone(),
        );
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_reset_saturates_at_clock_end() {
        let (limiter, clock) = local_limiter(1, Duration::from_millis(MAX_WINDOW_MS));
        clock.set(u64::MAX - 10);
        let id = Identifier::from("1.2.3.4");

        let admitted = limiter.check(&id).await;
        assert!(admitted.allowed);
        assert_eq!(admitted.reset_at_epoch_ms, u64::MAX);

        let denied = limiter.check(&id).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_epoch_ms, u64::MAX);
    }

    #[tokio::test]
    async fn test_five_per_minute_scenario() {
        let (limiter, clock) = local_limiter(5, Duration::from_secs(60));
        let id = Identifier::from("1.2.3.4");

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter.check(&id).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.reset_at_epoch_ms, clock.now_ms() + 60_000);
            clock.advance(Duration::from_millis(100));
        }

        let decision = limiter.check(&id).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        // The first admission at START leaves the window first.
        assert_eq!(decision.reset_at_epoch_ms, START + 60_000);
    }

    #[tokio::test]
    async fn test_window_rolls_after_reset() {
        let (limiter, clock) = local_limiter(2, Duration::from_secs(10));
        let id = Identifier::from("1.2.3.4");

        limiter.check(&id).await;
        clock.advance(Duration::from_secs(1));
        limiter.check(&id).await;

        let denied = limiter.check(&id).await;
        assert!(!denied.allowed);

        clock.set(denied.reset_at_epoch_ms);
        let decision = limiter.check(&id).await;
        assert!(decision.allowed);
        // Only the second admission is still in the window.
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_denials_do_not_consume_quota() {
        let (limiter, clock) = local_limiter(1, Duration::from_secs(10));
        let id = Identifier::from("1.2.3.4");

        assert!(limiter.check(&id).await.allowed);
        for _ in 0..10 {
            clock.advance(Duration::from_millis(500));
            assert!(!limiter.check(&id).await.allowed);
        }

        // Only the single admission counts, so the window opens at START + 10s.
        clock.set(START + 10_000);
        assert!(limiter.check(&id).await.allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let (limiter, _clock) = local_limiter(1, Duration::from_secs(60));

        assert!(limiter.check(&Identifier::from("a")).await.allowed);
        assert!(!limiter.check(&Identifier::from("a")).await.allowed);
        assert!(limiter.check(&Identifier::from("b")).await.allowed);
    }

    #[tokio::test]
    async fn test_never_more_than_limit_in_any_window() {
        let (limiter, clock) = local_limiter(3, Duration::from_millis(1_000));
        let id = Identifier::from("1.2.3.4");
        let mut admitted = Vec::new();

        for _ in 0..100 {
            if limiter.check(&id).await.allowed {
                admitted.push(clock.now_ms());
            }
            clock.advance(Duration::from_millis(70));
        }

        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..].iter().take_while(|&&t| t < start + 1_000).count();
            assert!(in_window <= 3, "window starting at {start} admitted {in_window}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_respect_limit() {
        let (limiter, _clock) = local_limiter(10, Duration::from_secs(60));
        let limiter = Arc::new(limiter);
        let id = Identifier::from("1.2.3.4");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let id = id.clone();
                tokio::spawn(async move { limiter.check(&id).await.allowed })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = RateLimiter::new(
            "ai",
            LimiterConfig::new(5, Duration::from_secs(60)).unwrap(),
            Box::new(FailingStore),
            clock,
        );

        let decision = limiter.check(&Identifier::from("1.2.3.4")).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.reset_at_epoch_ms, START + 60_000);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_when_configured() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = RateLimiter::new(
            "ai",
            LimiterConfig::new(5, Duration::from_secs(60)).unwrap(),
            Box::new(FailingStore),
            clock,
        )
        .with_failure_policy(FailurePolicy::Closed);

        let decision = limiter.check(&Identifier::from("1.2.3.4")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_store_key_is_namespaced() {
        let (limiter, _clock) = local_limiter(1, Duration::from_secs(1));
        let limiter = limiter.with_key_prefix("rl");
        assert_eq!(limiter.store_key(&Identifier::from("9.9.9.9")), "rl:test:9.9.9.9");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = Decision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at_epoch_ms: 10_001,
        };
        assert_eq!(decision.retry_after(9_000), Duration::from_secs(2));
        assert_eq!(decision.retry_after(20_000), Duration::ZERO);
    }

    #[test]
    fn test_failure_policy_parses_lowercase() {
        let policy: FailurePolicy = serde_yaml::from_str("closed").unwrap();
        assert_eq!(policy, FailurePolicy::Closed);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Open);
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let decision = Decision {
            allowed: true,
            limit: 5,
            remaining: 4,
            reset_at_epoch_ms: 42,
        };
        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json["resetAtEpochMs"], 42);
        assert_eq!(json["allowed"], true);
    }
}
