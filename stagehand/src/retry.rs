//! Bounded retry of fallible operations.
//!
//! Every external call (generator process, mutation target, state file write)
//! goes through [`RetryExecutor::run`]. The caller supplies a predicate that
//! decides which failures are transient; anything else fails on the spot.

use std::io;
use std::thread;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::errors::RetriesExhausted;

/// Whether repeating an operation is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    /// Side-effecting call; runs at most once.
    NonIdempotent,
}

/// Result of one [`RetryExecutor::run`] invocation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Attempts made, always at least 1.
    pub attempts: u32,
    /// The value, or the last error annotated with [`RetriesExhausted`].
    pub result: Result<T>,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Non-idempotent operations get a
    /// single attempt regardless of the policy.
    #[instrument(skip_all, fields(operation = operation))]
    pub fn run<T, F, C>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        mut op: F,
        is_retryable: C,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T>,
        C: Fn(&anyhow::Error) -> bool,
    {
        let max_attempts = match idempotency {
            Idempotency::Idempotent => self.policy.max_attempts.max(1),
            Idempotency::NonIdempotent => 1,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "operation recovered after retry");
                    }
                    return RetryOutcome {
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(err) => err,
            };

            let retryable = is_retryable(&err);
            if !retryable || attempt >= max_attempts {
                if retryable {
                    warn!(attempt, err = %format!("{err:#}"), "retries exhausted");
                } else {
                    debug!(attempt, err = %format!("{err:#}"), "failure is not retryable");
                }
                return RetryOutcome {
                    attempts: attempt,
                    result: Err(err.context(RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                    })),
                };
            }

            let delay = self.policy.delay(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                err = %format!("{err:#}"),
                "transient failure, retrying"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }
}

/// True when `err` wraps an I/O error that usually clears on its own
/// (busy device, interrupted call, lock contention on a syncing filesystem).
pub fn is_transient_io(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ResourceBusy
            )
        })
}
