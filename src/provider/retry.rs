//! Retry wrapper for outbound sends.
//!
//! Only rate-limit errors are retried; anything else surfaces immediately.
//! The backoff is a fixed pause, not exponential, because providers already
//! tell us how long to wait and we cap attempts low.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::traits::ProviderError;

/// Retry policy for rate-limited sends
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first call
    pub max_retries: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Run `op`, retrying on rate-limit errors up to `policy.max_retries` times.
///
/// Non-rate-limit errors are returned on the first occurrence. When retries
/// are exhausted the last rate-limit error is returned.
pub async fn with_retry<T, Fut, F>(policy: &RetryPolicy, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limit() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    "Rate limited, retrying in {:?} (attempt {}/{})",
                    policy.backoff, attempt, policy.max_retries
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
