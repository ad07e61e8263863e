//! HTTP surface for request handlers running outside this process.

mod handlers;
mod middleware;
mod server;

pub use handlers::{
    apply_rate_limit_headers, decision_response, AppState, CheckParams, LIMIT_HEADER,
    REMAINING_HEADER, RESET_HEADER, RETRY_AFTER_HEADER,
};
pub use middleware::{rate_limit_middleware, GuardState};
pub use server::{router, HttpServer};
