//! Bounded retry with exponential backoff and per-attempt timeouts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How network calls are retried.
///
/// Attempt `n` that fails with a retryable error is followed by a pause of
/// `base_delay * 2^(n-1)`. Each attempt races `timeout`; the losing attempt
/// is dropped, which aborts the in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
      timeout: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Pause after the given (1-based) failed attempt.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    self.base_delay.saturating_mul(1u32 << exponent)
  }

  /// Run `call` until it succeeds, fails with a non-retryable error, or
  /// `max_attempts` is reached.
  pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      let outcome = match tokio::time::timeout(self.timeout, call()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(self.timeout)),
      };

      match outcome {
        Ok(value) => {
          if attempt > 1 {
            debug!(operation, attempt, "Succeeded after retry");
          }
          return Ok(value);
        }
        Err(e) if e.is_retryable() && attempt < max_attempts => {
          let delay = self.delay_for(attempt);
          warn!(
            operation,
            attempt,
            max_attempts,
            ?delay,
            error = %e,
            "Retrying after transport failure"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;
  use tokio::time::Instant;

  fn policy() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 3,
      base_delay: Duration::from_millis(100),
      timeout: Duration::from_secs(1),
    }
  }

  #[test]
  fn test_delay_doubles_per_attempt() {
    let policy = policy();
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(400));
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_transport_failure_exhausts_attempts() {
    let starts = Mutex::new(Vec::new());

    let result: Result<()> = policy()
      .run("list", || {
        starts.lock().unwrap().push(Instant::now());
        async { Err(Error::Transport("connection refused".into())) }
      })
      .await;

    assert_eq!(result, Err(Error::Transport("connection refused".into())));
    let starts = starts.into_inner().unwrap();
    assert_eq!(starts.len(), 3);
    assert!(starts[1] - starts[0] >= Duration::from_millis(100));
    assert!(starts[2] - starts[1] >= Duration::from_millis(200));
  }

  #[tokio::test(start_paused = true)]
  async fn test_business_errors_are_not_retried() {
    let calls = AtomicU32::new(0);

    let result: Result<()> = policy()
      .run("update", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::Conflict("stale version".into())) }
      })
      .await;

    assert!(result.unwrap_err().is_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_aborts_attempt_and_retries() {
    let calls = AtomicU32::new(0);

    let result = policy()
      .run("get", || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
          }
          Ok(n)
        }
      })
      .await;

    assert_eq!(result, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_after_transient_failure() {
    let calls = AtomicU32::new(0);

    let result = policy()
      .run("create", || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 2 {
            Err(Error::Transport("reset".into()))
          } else {
            Ok("created")
          }
        }
      })
      .await;

    assert_eq!(result, Ok("created"));
  }
}
