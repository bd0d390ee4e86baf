//! Retry loop for transient failures of external calls.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tracing::{debug, warn};

use crate::core::retry::{ErrorClass, RetryPolicy, backoff_delay, classify_failure};
use crate::error::{HaltKind, Interrupted, RetriesExhausted, StructuralHalt};
use crate::io::signal::CancelFlag;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Run `call` until it succeeds, fails fatally, or exhausts `policy`.
///
/// Structural halts and interrupts pass through untouched. Failures whose
/// text classifies as fatal become a [`StructuralHalt`] of kind `Permission`.
/// Transient failures past the last attempt become [`RetriesExhausted`].
pub fn retry_transient<T>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancelFlag,
    mut call: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        cancel.check()?;
        let err = match call() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        if err.downcast_ref::<StructuralHalt>().is_some()
            || err.downcast_ref::<Interrupted>().is_some()
        {
            return Err(err);
        }
        let message = format!("{err:#}");
        if classify_failure(&message) == ErrorClass::Fatal {
            warn!(operation, err = %message, "fatal failure, not retrying");
            return Err(
                StructuralHalt::new(HaltKind::Permission, format!("{operation}: {message}")).into(),
            );
        }
        if attempt >= max_attempts {
            warn!(operation, attempts = attempt, err = %message, "retries exhausted");
            return Err(RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                last: message,
            }
            .into());
        }
        let unit: f64 = rand::thread_rng().r#gen();
        let delay = backoff_delay(policy, attempt, unit);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            err = %message,
            "transient failure, retrying"
        );
        sleep_unless_cancelled(delay, cancel)?;
        attempt += 1;
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> Result<()> {
    let deadline = Instant::now() + delay;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
