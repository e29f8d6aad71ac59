//! Shared helpers
//!
//! - retry: exponential backoff policies and a generic retry loop

mod retry;

pub use retry::{exponential_backoff, retry_with_backoff, RetryConfig, RetryError};
