//! Retry with exponential backoff for archive requests.
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::daomop_errors::DaomopError;

/// How often and how patiently a failed fetch is retried.
///
/// Attempt `k` (1-based) that fails with a transient error is followed by a pause of
/// `initial_backoff · multiplier^(k−1)`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy with a single attempt.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// Pause after the failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Return
    /// ----------
    /// * `Err(DaomopError::InvalidParameter)` if `max_attempts` is zero or `multiplier` is
    ///   below 1.
    pub fn validate(&self) -> Result<(), DaomopError> {
        if self.max_attempts == 0 {
            return Err(DaomopError::InvalidParameter(
                "max_attempts must be >= 1".into(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(DaomopError::InvalidParameter(
                "backoff multiplier must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Arguments
    /// -----------------
    /// * `exposure_id`: the exposure being fetched (used in errors and logs).
    /// * `op`: the request; receives the 1-based attempt number.
    ///
    /// Return
    /// ----------
    /// * The first successful result.
    /// * The error itself when it is not transient (e.g. [`DaomopError::NotFoundError`]).
    /// * `Err(DaomopError::FetchError)` carrying the last error once `max_attempts` transient
    ///   failures have occurred.
    /// * `Err(DaomopError::InvalidParameter)` if the policy itself is invalid.
    pub async fn run<T, F, Fut>(&self, exposure_id: &str, mut op: F) -> Result<T, DaomopError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DaomopError>>,
    {
        self.validate()?;
        let max_attempts = self.max_attempts;
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Exposure {exposure_id} fetched on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(DaomopError::FetchError {
                        exposure: exposure_id.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
                Err(err) => {
                    let pause = self.backoff(attempt);
                    warn!(
                        "Fetch of exposure {exposure_id} failed (attempt {attempt}/{max_attempts}): {err}; retrying in {pause:?}"
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
            }
        }
    }
}
