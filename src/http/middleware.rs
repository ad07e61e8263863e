//! Middleware guarding routes with a named limiter.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::ratelimit::{resolve_identifier, Clock, LimiterRegistry};

use super::handlers::{apply_rate_limit_headers, decision_response};

/// Shared state for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct GuardState {
    /// Registry holding the limiter
    pub registry: Arc<LimiterRegistry>,
    /// Limiter applied to every request through this layer
    pub limiter: String,
    /// Time source for `Retry-After`
    pub clock: Arc<dyn Clock>,
}

impl GuardState {
    /// Guard with the named limiter.
    pub fn new(
        registry: Arc<LimiterRegistry>,
        limiter: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            limiter: limiter.into(),
            clock,
        }
    }
}

/// Rate limiting middleware function.
///
/// Runs before the route handler. Denied requests get a 429 carrying the
/// decision; admitted responses get the `X-RateLimit-*` headers added.
pub async fn rate_limit_middleware(
    State(state): State<GuardState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identifier = resolve_identifier(request.headers());

    let decision = match state.registry.check_limit(&state.limiter, &identifier).await {
        Ok(decision) => decision,
        Err(err) => return err.into_response(),
    };

    if !decision.allowed {
        debug!(
            limiter = %state.limiter,
            identifier = %identifier,
            "Rejecting request over limit"
        );
        return decision_response(decision, state.clock.now_ms());
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision, state.clock.now_ms());
    response
}
