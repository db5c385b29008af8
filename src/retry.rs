use std::future::Future;
use std::time::Duration;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Exponential backoff bounded by a ceiling rather than an attempt count.
///
/// The wait starts at `initial_delay` and doubles after every failure. Before
/// each sleep the scheduled wait is compared against `ceiling`; once it would
/// reach or exceed the ceiling the last error is returned without sleeping.
/// With the defaults (2s, 30s) that gives waits of 2, 4, 8 and 16 seconds
/// between five attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    pub fn from_secs(initial_delay_secs: u64, ceiling_secs: u64) -> Self {
        Self {
            initial_delay: Duration::from_secs(initial_delay_secs),
            ceiling: Duration::from_secs(ceiling_secs),
        }
    }

    /// The finite schedule of waits this policy allows between attempts.
    ///
    /// A zero initial delay can never reach the ceiling by doubling, so it
    /// yields an empty schedule (one attempt, no retries).
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        if self.initial_delay.is_zero() {
            return delays;
        }
        let mut delay = self.initial_delay;
        while delay < self.ceiling {
            delays.push(delay);
            delay = delay.saturating_mul(2);
        }
        delays
    }

    /// Total number of attempts implied by the schedule.
    pub fn max_attempts(&self) -> usize {
        self.delays().len() + 1
    }
}

/// Retry an async operation with doubling delays until the ceiling.
///
/// - `config`: backoff schedule
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: the async closure to retry
///
/// Returns the first `Ok` result, the error the classifier aborted on, or the
/// error of the final attempt once the next wait would hit the ceiling.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &BackoffConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let delays = config.delays();
    let total_attempts = delays.len() + 1;

    for (attempt, delay) in delays.into_iter().enumerate() {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort {
                    return Err(e);
                }
                tracing::warn!(
                    "Error \"{}\" (attempt {}/{}), retrying in {}s",
                    e,
                    attempt + 1,
                    total_attempts,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    // The next wait would reach the ceiling: this attempt is the last one.
    operation().await
}
