//! Retry engine: schedule generation and the attempt/retry driver.
//!
//! A [`RetryPolicy`] describes the shape of the backoff; [`RetrySchedule`]
//! is the concrete list of delays generated from it for one call; a
//! [`RetryOperation`] drives re-attempts of a user operation over a
//! schedule.

use crate::clock::{Sleeper, TokioSleeper};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backoff configuration.
///
/// For attempt index `i` the delay is
/// `clamp(round(r · min_timeout · factor^i), min_timeout, max_timeout)`
/// with `r` drawn uniformly from `[1, 2)` when `randomize` is set, and the
/// resulting list sorted ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
    pub factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            factor: 2.0,
            min_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_millis(400),
            randomize: true,
        }
    }
}

/// Errors returned when a retry policy is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("min_timeout {min:?} exceeds max_timeout {max:?}")]
    MinExceedsMax { min: Duration, max: Duration },
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.min_timeout > self.max_timeout {
            return Err(RetryConfigError::MinExceedsMax {
                min: self.min_timeout,
                max: self.max_timeout,
            });
        }
        Ok(())
    }

    /// Generate a schedule with the thread RNG.
    pub fn schedule(&self) -> Result<RetrySchedule, RetryConfigError> {
        self.schedule_with_rng(&mut rand::rng())
    }

    /// Generate a schedule with a caller-supplied RNG (deterministic tests).
    pub fn schedule_with_rng<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<RetrySchedule, RetryConfigError> {
        self.validate()?;

        let min = self.min_timeout.as_millis() as u64;
        let max = self.max_timeout.as_millis() as u64;

        let mut delays: Vec<u64> = (0..self.retries)
            .map(|attempt| {
                let r = if self.randomize { rng.random_range(1.0..2.0) } else { 1.0 };
                let raw = r * min as f64 * self.factor.powi(attempt as i32);
                let millis = if raw.is_finite() { raw.round() as u64 } else { u64::MAX };
                millis.clamp(min, max)
            })
            .collect();
        delays.sort_unstable();

        Ok(RetrySchedule { delays: delays.into_iter().map(Duration::from_millis).collect() })
    }

    /// Build a driver for `operation` over a freshly generated schedule.
    /// The operation receives the 1-based attempt ordinal.
    pub fn operation<F>(&self, operation: F) -> Result<RetryOperation<F>, RetryConfigError> {
        Ok(RetryOperation::new(self.schedule()?, operation))
    }
}

/// Ascending list of delays for one call; length equals the configured
/// retry count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

/// Drives re-attempts of an operation over a [`RetrySchedule`].
pub struct RetryOperation<F> {
    schedule: RetrySchedule,
    sleeper: Arc<dyn Sleeper>,
    operation: F,
    /// 1-based ordinal of the current attempt.
    attempt: u32,
    consumed: usize,
}

impl<F> RetryOperation<F> {
    pub fn new(schedule: RetrySchedule, operation: F) -> Self {
        Self {
            schedule,
            sleeper: Arc::new(TokioSleeper),
            operation,
            attempt: 1,
            consumed: 0,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Ordinal the next [`attempt`](Self::attempt) call runs as.
    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }

    /// Run the operation immediately with the current attempt ordinal.
    pub async fn attempt<Fut>(&mut self) -> Fut::Output
    where
        F: FnMut(u32) -> Fut,
        Fut: Future,
    {
        (self.operation)(self.attempt).await
    }

    /// Consume the next scheduled delay (sleeping through it unless
    /// `immediate`) and advance to the next attempt ordinal. Returns `None`
    /// when the schedule is exhausted.
    pub async fn retry(&mut self, immediate: bool) -> Option<u32> {
        let delay = *self.schedule.delays.get(self.consumed)?;
        self.consumed += 1;
        if !immediate && !delay.is_zero() {
            self.sleeper.sleep(delay).await;
        }
        self.attempt += 1;
        Some(self.attempt)
    }
}
