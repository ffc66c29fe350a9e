//! Investigation job queue: rate limiting and the worker that drains it.

pub mod rate_limit;
pub mod worker;

pub use rate_limit::{RateDecision, RateLimiter};
pub use worker::{JobWorker, WorkerReport, INVESTIGATION_JOBS, ROLLOUT_JOBS};
