//! Reliability primitives
//!
//! - [`RetryPolicy`] - capped exponential backoff for activity retries

mod retry;

pub use retry::RetryPolicy;
