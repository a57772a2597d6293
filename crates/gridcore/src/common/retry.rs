//! Bounded retries with a fixed delay between attempts.
//!
//! External calls (queue backend commands, cloud API requests) are never retried indefinitely.
//! Exhausting the attempts is reported to the caller as a value, so that it can decide whether
//! the failure is transient (try again in the next cycle) or fatal.
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        assert!(attempts > 0);
        Self { attempts, delay }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Policy that keeps polling for (approximately) `timeout`, checking every `delay`.
    pub fn from_timeout(timeout: Duration, delay: Duration) -> Self {
        let attempts = if delay.is_zero() {
            1
        } else {
            (timeout.as_millis() / delay.as_millis()).max(1) as u32
        };
        Self::new(attempts, delay)
    }
}

/// Result of a single polling step.
pub enum Poll<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not there yet, try again after the delay.
    Pending,
    /// The awaited condition can never hold, stop polling.
    Abort(anyhow::Error),
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready(T),
    Aborted(anyhow::Error),
    Exhausted { attempts: u32 },
}

impl<T> PollOutcome<T> {
    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            PollOutcome::Ready(value) => Ok(value),
            PollOutcome::Aborted(error) => Err(error),
            PollOutcome::Exhausted { attempts } => Err(anyhow::anyhow!(RetriesExhausted {
                attempts
            })),
        }
    }
}

#[derive(Debug)]
pub struct RetriesExhausted {
    pub attempts: u32,
}

impl Display for RetriesExhausted {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Condition was not met after {} attempt(s)", self.attempts)
    }
}

impl std::error::Error for RetriesExhausted {}

/// Calls `op` until it returns [`Poll::Ready`] or [`Poll::Abort`], at most `policy.attempts`
/// times. There is no delay after the last attempt.
pub async fn poll<T, F, Fut>(policy: RetryPolicy, mut op: F) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Poll<T>>,
{
    for attempt in 1..=policy.attempts {
        match op(attempt).await {
            Poll::Ready(value) => return PollOutcome::Ready(value),
            Poll::Abort(error) => return PollOutcome::Aborted(error),
            Poll::Pending => {
                if attempt < policy.attempts && !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    PollOutcome::Exhausted {
        attempts: policy.attempts,
    }
}

/// Calls `op` until it succeeds, at most `policy.attempts` times.
/// Returns the last error if no attempt succeeded.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= policy.attempts => {
                return Err(error.context(RetriesExhausted { attempts: attempt }));
            }
            Err(error) => {
                log::debug!(
                    "Attempt {attempt}/{} failed, retrying: {error:?}",
                    policy.attempts
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
        }
    }
}
