//! HTTP transport: classification, retry and authenticated execution

pub mod classify;
pub mod executor;
pub mod retry;

pub use classify::{ClassifiedOutcome, DEFAULT_RETRY_AFTER_SECS, classify};
pub use executor::{REQUEST_ID_HEADER, RequestExecutor};
pub use retry::{Attempt, AttemptError, Jitter, RetryPolicy};
