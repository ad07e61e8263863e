//! Ratewarden - request-rate admission control
//!
//! This crate decides, per caller, whether a request may proceed within a
//! rolling time window. Limits are enforced with a sliding-window log kept
//! either in Upstash Redis, shared by every server process, or in process
//! memory as a fallback.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
