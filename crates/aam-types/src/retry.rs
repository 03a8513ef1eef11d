//! Retry combinator for transient storage errors (`spec.md` §5, §7).
//!
//! Replaces the exception-driven retry loops of the original design (see
//! `spec.md` §9) with an explicit combinator over [`crate::error::AamError`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AamError;

/// Bounded retry count and fixed interval shared by every storage call and
/// quiescence poll (`spec.md` §5: "every storage call has a per-operation
/// timeout and bounded retry count").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Constructs a policy with `max_attempts` attempts spaced `interval` apart.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts, interval }
    }

    /// A single-attempt, no-wait policy — useful in tests that want
    /// deterministic failure without delay.
    pub const NONE: RetryPolicy = RetryPolicy { max_attempts: 1, interval: Duration::from_millis(0) };
}

/// Runs `operation` up to `policy.max_attempts` times, sleeping
/// `policy.interval` between attempts, retrying only errors for which
/// `is_transient` is true. A transient error that exhausts the budget is
/// escalated to [`AamError::StorageFault`]; a non-transient error is
/// returned immediately without consuming further attempts.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, AamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AamError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                tokio::time::sleep(policy.interval).await;
                continue;
            }
            Err(err) if err.is_transient() => {
                return Err(AamError::StorageFault(format!(
                    "exhausted {} attempts: {err}",
                    policy.max_attempts
                )));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Polls `check` until it returns `true` or `policy.max_attempts` is
/// exhausted, sleeping `policy.interval` after every failed attempt
/// (including the last) before giving up. Used by the splitter/merger to
/// wait for router quiescence (`spec.md` §4.7 step 4b); `spec.md` §8
/// scenario S6 requires the full `max_attempts * interval` budget to
/// elapse before `QuiescenceTimeout` is raised.
pub async fn poll_until<F, Fut>(policy: RetryPolicy, mut check: F) -> Result<(), AamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..policy.max_attempts {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(policy.interval).await;
    }
    Err(AamError::QuiescenceTimeout { attempts: policy.max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result = with_retry(policy, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(AamError::TransientStorageError("blip".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn escalates_to_storage_fault_after_exhaustion() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<(), AamError> =
            with_retry(policy, || async { Err(AamError::TransientStorageError("down".into())) }).await;
        assert!(matches!(result, Err(AamError::StorageFault(_))));
    }

    #[tokio::test]
    async fn non_transient_errors_bypass_retry() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);
        let result: Result<(), AamError> = with_retry(policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AamError::ValidationError("bad input".into())) }
        })
        .await;
        assert!(matches!(result, Err(AamError::ValidationError(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_times_out() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = poll_until(policy, || async { false }).await;
        assert!(matches!(result, Err(AamError::QuiescenceTimeout { attempts: 3 })));
    }
}
