use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1000);

/// Fixed-delay retry for idempotent setup work such as fetching a package or
/// connecting to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries, including the first one. Zero behaves like one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Run `op` until it succeeds, returns an error `retryable` rejects, or
    /// the attempts run out. The last error is returned as-is.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max && retryable(&err) => {
                    warn!(attempt, max, "{what} failed, retrying in {:?}: {err}", self.delay);
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn stops_after_configured_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let res: Result<(), String> = policy
            .run(
                "op",
                |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("boom".to_string())
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(res, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let res: Result<u32, String> = policy
            .run(
                "op",
                |attempt| async move {
                    if attempt < 3 { Err(format!("attempt {attempt}")) } else { Ok(attempt) }
                },
                |_| true,
            )
            .await;
        assert_eq!(res, Ok(3));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let res: Result<(), String> = policy
            .run(
                "op",
                |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("fatal".to_string())
                    }
                },
                |e: &String| e != "fatal",
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
