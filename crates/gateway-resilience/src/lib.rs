//! # Gateway Resilience
//!
//! Request pacing and failover for the balancer:
//! - Per-identity rate limiting with a simple and a cooldown policy
//! - Shuffled sequential failover across a pool of upstream keys

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod failover;
pub mod rate_limit;

pub use failover::{Attempt, FailoverSuccess, KeyPoolFailover};
pub use rate_limit::{RateLimitPolicy, RateLimiter, RateLimiterConfig};
