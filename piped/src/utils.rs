//! Utility functions

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::PipedError;

/// Version information for piped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: option_env!("GIT_VERSION")
            .unwrap_or(env!("CARGO_PKG_VERSION"))
            .to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Wait strategy between two attempts of a [`Retry`]
#[derive(Debug, Clone)]
pub enum Backoff {
    Constant(Duration),
    Exponential(CooldownOptions),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant(d) => *d,
            Backoff::Exponential(options) => calc_exp_backoff(options, attempt),
        }
    }
}

/// Bounded retry of a fallible async operation
#[derive(Debug, Clone)]
pub struct Retry {
    max_attempts: u32,
    backoff: Backoff,
}

impl Retry {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Constant backoff retry
    pub fn constant(max_attempts: u32, interval: Duration) -> Self {
        Self::new(max_attempts, Backoff::Constant(interval))
    }

    /// Exponential backoff retry with the default cooldown options
    pub fn exponential(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::Exponential(CooldownOptions::default()))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `f` until it succeeds or the attempts are exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T, PipedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipedError>>,
    {
        self.run_while(f, |_| true).await
    }

    /// Same as [`Retry::run`] but stops early when `should_retry` rejects the error.
    pub async fn run_while<T, F, Fut, P>(&self, mut f: F, should_retry: P) -> Result<T, PipedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipedError>>,
        P: Fn(&PipedError) -> bool,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !should_retry(&e) {
                        return Err(e);
                    }
                    let wait = self.backoff.delay(attempt - 1);
                    debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// First seven characters of a commit hash
pub fn short_hash(hash: &str) -> &str {
    match hash.char_indices().nth(7) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}

/// Current unix timestamp in seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exp_backoff() {
        let options = CooldownOptions::default();

        assert_eq!(calc_exp_backoff(&options, 0), Duration::from_secs(1));
        assert_eq!(calc_exp_backoff(&options, 1), Duration::from_secs(2));
        assert_eq!(calc_exp_backoff(&options, 2), Duration::from_secs(4));
        assert_eq!(calc_exp_backoff(&options, 10), Duration::from_secs(300)); // Capped at max
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("bbdc2ed674ce4fd987"), "bbdc2ed");
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash(""), "");
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let retry = Retry::constant(3, Duration::from_millis(1));
        let result = retry
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PipedError::Retryable("not yet".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_rejected_error() {
        let calls = AtomicU32::new(0);
        let retry = Retry::constant(5, Duration::from_millis(1));
        let result: Result<(), _> = retry
            .run_while(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipedError::Config("bad".into()))
                },
                |e| e.is_retryable(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
