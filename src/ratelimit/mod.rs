//! Rate limiting logic and state management.

mod backend;
mod clock;
mod distributed;
mod identity;
mod limiter;
mod local;
mod registry;
mod status;
mod window;

pub use backend::WindowStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::UpstashStore;
pub use identity::{resolve_identifier, Identifier, FORWARDED_FOR, REAL_IP};
pub use limiter::{Decision, FailurePolicy, RateLimiter};
pub use local::LocalStore;
pub use registry::{LimiterRegistry, SweeperHandle};
pub use status::{get_status, LimiterStatus, Provider};
pub use window::{LimiterConfig, WindowOutcome, MAX_WINDOW_MS};
