//! Distributed window store using Upstash Redis.
//!
//! This module keeps the sliding-window log in a Redis sorted set reached
//! through Upstash's REST API, so every server process shares one log per
//! caller. The whole prune/count/append step runs as a single Lua script,
//! which Redis executes atomically.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::UpstashCredentials;
use crate::error::{Result, StoreError};

use super::backend::WindowStore;
use super::status::Provider;
use super::window::{LimiterConfig, WindowOutcome};

/// Sliding-window log step.
///
/// KEYS[1] = log key; ARGV = now ms, window ms, limit, member.
/// Returns `{admitted, count, oldest}` with `oldest = -1` for an empty log.
const SLIDING_LOG_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  count = count + 1
  admitted = 1
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {admitted, count, oldest_ms}
"#;

/// Body of an Upstash REST reply.
#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// A window store backed by Upstash Redis.
pub struct UpstashStore {
    /// HTTP client carrying the request timeout
    client: reqwest::Client,
    /// REST endpoint
    url: String,
    /// Bearer token
    token: String,
    /// Timeout applied to every call, kept for error reporting
    timeout: Duration,
}

impl std::fmt::Debug for UpstashStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstashStore")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl UpstashStore {
    /// Create a store with its own HTTP client.
    pub fn new(credentials: &UpstashCredentials, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, credentials, timeout))
    }

    /// Create a store on an existing HTTP client.
    ///
    /// The client's connection pool is shared; the timeout is applied per
    /// request.
    pub fn with_client(
        client: reqwest::Client,
        credentials: &UpstashCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: credentials.url.trim_end_matches('/').to_string(),
            token: credentials.token.clone(),
            timeout,
        }
    }

    /// Send one Redis command and return its `result`.
    async fn command(&self, command: &[String]) -> std::result::Result<Value, StoreError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(command)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        let reply: Option<UpstashReply> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = reply
                .and_then(|r| r.error)
                .unwrap_or_else(|| body.trim().to_string());
            return Err(StoreError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let reply = reply.ok_or_else(|| StoreError::Malformed(body.clone()))?;
        if let Some(message) = reply.error {
            return Err(StoreError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        reply
            .result
            .ok_or_else(|| StoreError::Malformed("reply has no result".to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout.as_millis() as u64)
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

/// Decode the script's `{admitted, count, oldest}` reply.
fn parse_outcome(result: &Value) -> std::result::Result<WindowOutcome, StoreError> {
    let malformed = || StoreError::Malformed(result.to_string());

    let fields = result.as_array().filter(|a| a.len() == 3).ok_or_else(malformed)?;
    let admitted = fields[0].as_i64().ok_or_else(malformed)?;
    let count = fields[1].as_u64().ok_or_else(malformed)?;
    let oldest = fields[2].as_i64().ok_or_else(malformed)?;

    Ok(WindowOutcome {
        admitted: admitted == 1,
        count: u32::try_from(count).map_err(|_| malformed())?,
        oldest_ms: u64::try_from(oldest).ok(),
    })
}

#[async_trait]
impl WindowStore for UpstashStore {
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        config: &LimiterConfig,
    ) -> std::result::Result<WindowOutcome, StoreError> {
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        let command = vec![
            "EVAL".to_string(),
            SLIDING_LOG_SCRIPT.to_string(),
            "1".to_string(),
            key.to_string(),
            now_ms.to_string(),
            config.window_ms().to_string(),
            config.limit().to_string(),
            member,
        ];

        trace!(key = %key, now_ms = now_ms, "Sending sliding window script to Upstash");

        let result = self.command(&command).await?;
        let outcome = parse_outcome(&result)?;

        debug!(
            key = %key,
            count = outcome.count,
            admitted = outcome.admitted,
            "Distributed window hit"
        );
        Ok(outcome)
    }

    fn provider(&self) -> Provider {
        Provider::Upstash
    }
}
