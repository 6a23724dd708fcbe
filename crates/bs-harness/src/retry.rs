use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::shutdown::ShutdownSignal;

/// Errors that say whether repeating the same operation could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Bounded retry with a fixed backoff.
///
/// Only transient errors are retried, and never once shutdown has been
/// triggered: a retry is new work.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retry.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(30),
        }
    }
}

/// The final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The backoff sleep is cut
    /// short by shutdown, in which case the last error is returned.
    pub async fn run<F, Fut, T, E>(&self, shutdown: &ShutdownSignal, mut op: F) -> Attempted<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Err(e)
                    if e.is_transient()
                        && attempt < self.max_attempts
                        && !shutdown.is_shutting_down() =>
                {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_secs = self.backoff.as_secs(),
                        error = %e,
                        "transient failure, will retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = shutdown.triggered() => {
                            info!(attempt, "shutdown during retry backoff, giving up");
                            return Attempted { result: Err(e), attempts: attempt };
                        }
                    }
                    attempt += 1;
                }
                result => {
                    return Attempted {
                        result,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
