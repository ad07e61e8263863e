//! Window store trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use crate::error::StoreError;

use super::status::Provider;
use super::window::{LimiterConfig, WindowOutcome};

/// Trait for window store implementations.
///
/// This trait abstracts over both the in-process `LocalStore` and the
/// network-backed `UpstashStore` so a `RateLimiter` can work with either.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Run one sliding-window log step for `key` at `now_ms`.
    ///
    /// Pruning, counting and the conditional append must happen atomically
    /// with respect to other hits on the same key.
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        config: &LimiterConfig,
    ) -> Result<WindowOutcome, StoreError>;

    /// Drop keys with no entry younger than the window.
    ///
    /// Returns the number of keys removed. Stores whose backend expires keys
    /// on its own keep the default.
    fn sweep(&self, _now_ms: u64, _config: &LimiterConfig) -> usize {
        0
    }

    /// The provider this store reports in status output.
    fn provider(&self) -> Provider;
}
