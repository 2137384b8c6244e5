//! Bounded retry-with-delay.
//!
//! The session store is eventually consistent between the two agents: a
//! fragment call can arrive at the egress side before the session created a
//! beat earlier is visible. The policy lives here, parameterized and separate
//! from its call sites.

use std::time::Duration;

/// Runs `op` up to `attempts` times, sleeping `delay` between attempts, as
/// long as the error satisfies `is_retryable`. The first success, the first
/// non-retryable error, or the final attempt's result is returned.
pub(crate) async fn retry<T, E, F, Fut>(
    attempts: usize,
    delay: Duration,
    mut is_retryable: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    debug_assert!(attempts > 0);
    let mut last = op().await;
    for _ in 1..attempts {
        match &last {
            Ok(_) => return last,
            Err(err) if is_retryable(err) => tokio::time::sleep(delay).await,
            Err(_) => return last,
        }
        last = op().await;
    }
    last
}
