//! Request handlers for the admission API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::error::Result;
use crate::ratelimit::{resolve_identifier, Clock, Decision, Identifier, LimiterRegistry};

/// Header carrying the limiter's quota.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Header carrying admissions left in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Header carrying the RFC 3339 instant the quota frees up.
pub const RESET_HEADER: &str = "x-ratelimit-reset";
/// Header carrying whole seconds to wait after a denial.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Shared state for the admission API.
#[derive(Clone)]
pub struct AppState {
    /// The limiters being served
    pub registry: Arc<LimiterRegistry>,
    /// Time source for `Retry-After`
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create the handler state.
    pub fn new(registry: Arc<LimiterRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }
}

/// Query parameters of a limit check.
#[derive(Debug, Default, Deserialize)]
pub struct CheckParams {
    /// Explicit caller key; when absent the key is resolved from headers
    pub identifier: Option<String>,
}

/// Add the `X-RateLimit-*` headers for a decision, plus `Retry-After` on denial.
///
/// The reset header is an RFC 3339 UTC timestamp with millisecond precision.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision, now_ms: u64) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));

    if let Some(reset) = format_reset(decision.reset_at_epoch_ms) {
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert(RESET_HEADER, value);
        }
    }

    if !decision.allowed {
        headers.insert(
            RETRY_AFTER_HEADER,
            HeaderValue::from(decision.retry_after(now_ms).as_secs()),
        );
    }
}

fn format_reset(epoch_ms: u64) -> Option<String> {
    let ms = i64::try_from(epoch_ms).ok()?;
    let at: DateTime<Utc> = DateTime::from_timestamp_millis(ms)?;
    Some(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Build the response for a decision: 200 when allowed, 429 otherwise.
pub fn decision_response(decision: Decision, now_ms: u64) -> Response {
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    let mut response = (status, Json(decision)).into_response();
    apply_rate_limit_headers(response.headers_mut(), &decision, now_ms);
    response
}

/// POST /v1/limits/{name}/check
#[instrument(skip_all, fields(limiter = %name))]
pub async fn check_limit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<CheckParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let identifier = params
        .identifier
        .filter(|id| !id.trim().is_empty())
        .map(|id| Identifier::new(id.trim()))
        .unwrap_or_else(|| resolve_identifier(&headers));

    let decision = state.registry.check_limit(&name, &identifier).await?;

    info!(
        limiter = %name,
        identifier = %identifier,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    Ok(decision_response(decision, state.clock.now_ms()))
}

/// GET /v1/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.status())
}

/// GET /health - liveness probe
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_reset_matches_iso_millis() {
        assert_eq!(
            format_reset(1_700_000_000_123).as_deref(),
            Some("2023-11-14T22:13:20.123Z")
        );
    }

    #[test]
    fn test_allowed_headers() {
        let decision = Decision {
            allowed: true,
            limit: 5,
            remaining: 4,
            reset_at_epoch_ms: 1_700_000_060_000,
        };
        let response = decision_response(decision, 1_700_000_000_000);

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[LIMIT_HEADER], "5");
        assert_eq!(headers[REMAINING_HEADER], "4");
        assert_eq!(headers[RESET_HEADER], "2023-11-14T22:14:20.000Z");
        assert!(headers.get(RETRY_AFTER_HEADER).is_none());
    }

    #[test]
    fn test_denied_headers() {
        let decision = Decision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at_epoch_ms: 1_700_000_030_500,
        };
        let response = decision_response(decision, 1_700_000_000_000);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[REMAINING_HEADER], "0");
        assert_eq!(headers[RETRY_AFTER_HEADER], "31");
    }
}
