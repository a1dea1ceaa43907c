//! Retry logic with exponential backoff
//!
//! Provides configurable retry behavior for gateway calls. Only errors
//! classified as retryable by `GatewayError` are retried; rejections and
//! fatal errors surface immediately.

use super::gateway_error::GatewayError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial call
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Build from the bot's `retry_count` / `retry_delay` parameters
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Default::default()
        }
    }
}

/// Execute an async closure with retry logic.
///
/// The closure should return `Result<T, GatewayError>`. Only retries if
/// `GatewayError::is_retryable()` returns true.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !err.is_retryable() || attempt > config.max_retries {
                    if attempt > config.max_retries {
                        warn!(
                            "[Retry] {} failed after {} attempts: {}",
                            operation_name, attempt, err
                        );
                    }
                    return Err(err);
                }

                debug!(
                    "[Retry] {} attempt {}/{} failed ({}), retrying in {:?}",
                    operation_name, attempt, config.max_retries, err, delay
                );

                sleep(delay).await;

                // Exponential backoff with cap
                delay = Duration::from_millis(
                    ((delay.as_millis() as f64 * config.backoff_factor) as u64)
                        .min(config.max_delay.as_millis() as u64),
                );
            }
        }
    }
}
