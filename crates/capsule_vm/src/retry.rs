//! Bounded retry with exponential backoff and jitter.
//!
//! Used for readiness polling: a freshly created VM refuses SSH for a while
//! and the only way to know it is up is to keep knocking.

use anyhow::Result;
use capsule_core::config::SshConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for each subsequent delay.
    pub backoff_factor: f64,
    /// Upper bound of the random extra added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl From<&SshConfig> for RetryConfig {
    fn from(ssh: &SshConfig) -> Self {
        Self {
            max_attempts: ssh.ready_max_attempts.max(1),
            initial_delay: Duration::from_secs(ssh.ready_delay_secs),
            max_delay: Duration::from_secs(ssh.ready_max_delay_secs),
            ..Self::default()
        }
    }
}

impl RetryConfig {
    /// Delay after the `attempt`-th failure (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Outcome of an exhausted retry loop.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: String,
}

/// Call `operation` until it succeeds or `max_attempts` is used up.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", what, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                tracing::debug!(
                    "{} failed on attempt {}/{}: {:#}",
                    what,
                    attempt,
                    config.max_attempts,
                    e
                );
                last_error = format!("{:#}", e);
            }
        }

        if attempt < config.max_attempts {
            let sleep_time = config.backoff(attempt) + config.jitter();
            tracing::info!(
                "{} retrying in {:.1}s (attempt {}/{})",
                what,
                sleep_time.as_secs_f64(),
                attempt + 1,
                config.max_attempts
            );
            tokio::time::sleep(sleep_time).await;
        }
    }

    Err(RetryExhausted {
        attempts: config.max_attempts,
        last_error,
    })
}
