//! Request middleware and per-producer admission control.
//!
//! This module provides:
//! - Request logging with latency tracking (an axum `from_fn` layer)
//! - The per-producer rate limiter, called by the approval workflow once a
//!   delivery's signature is verified

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
