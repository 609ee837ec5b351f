// Bounded retry with a fixed delay.
//
// Used wherever a transient not-ready condition is expected to resolve
// within a known window: gateway writes racing client-side initialization,
// nested-path lookups. Absence (not-found) is never retried; callers decide
// which errors count as transient by returning `RetryOutcome::Transient`.

use std::future::Future;
use std::time::Duration;

pub const WRITE_RETRY_ATTEMPTS: u32 = 10;
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One attempt's verdict.
pub enum RetryOutcome<T, E> {
    Done(T),
    /// Try again after the delay; the error is surfaced if attempts run out.
    Transient(E),
    /// Stop immediately without further attempts.
    Fatal(E),
}

/// Run `op` up to `max_attempts` times, sleeping `delay` between attempts.
///
/// Returns the last transient error when the budget is exhausted.
pub async fn retry_fixed<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryOutcome<T, E>>,
{
    debug_assert!(max_attempts > 0, "retry budget must allow at least one attempt");

    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match op(attempt).await {
            RetryOutcome::Done(value) => return Ok(value),
            RetryOutcome::Fatal(error) => return Err(error),
            RetryOutcome::Transient(error) => {
                last_error = Some(error);
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.expect("at least one attempt ran"))
}
