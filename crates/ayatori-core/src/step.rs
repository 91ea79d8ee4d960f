//! Step names and retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&StepName> for StepName {
    fn from(s: &StepName) -> Self {
        s.clone()
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

fn default_backoff_rate() -> f64 {
    1.0
}

/// Retry policy for a task step.
///
/// The first attempt runs immediately. After failed attempt `n` (1-based),
/// if attempts remain, the engine waits `interval * backoff_rate^(n-1)`,
/// capped at `max_delay_ms` when set.
///
/// # Examples
///
/// ```
/// use ayatori_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(4, Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default)]
    pub interval_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    /// Upper bound on any single delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            interval_ms: 0,
            backoff_rate: 1.0,
            max_delay_ms: None,
        }
    }

    /// Up to `max_attempts` attempts with a constant delay between them.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval_ms: interval.as_millis() as u64,
            backoff_rate: 1.0,
            max_delay_ms: None,
        }
    }

    /// Up to `max_attempts` attempts, doubling the delay each time, capped at 60s.
    pub fn exponential(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval_ms: initial_interval.as_millis() as u64,
            backoff_rate: 2.0,
            max_delay_ms: Some(60_000),
        }
    }

    /// Creates a policy with custom settings, validating every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if:
    /// - `max_attempts` is 0
    /// - `backoff_rate` is not a finite number of at least 1
    pub fn new(
        max_attempts: u32,
        interval: Duration,
        backoff_rate: f64,
    ) -> Result<Self, RetryPolicyError> {
        let policy = Self {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
            backoff_rate,
            max_delay_ms: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Caps every delay at `max_delay`.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if `max_delay` is below the base interval.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Result<Self, RetryPolicyError> {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self.validate()?;
        Ok(self)
    }

    /// Checks the invariants of a policy, e.g. one loaded from configuration.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError("max_attempts must be at least 1"));
        }
        if !self.backoff_rate.is_finite() || self.backoff_rate < 1.0 {
            return Err(RetryPolicyError("backoff_rate must be a finite number >= 1"));
        }
        if let Some(max_delay_ms) = self.max_delay_ms {
            if max_delay_ms < self.interval_ms {
                return Err(RetryPolicyError("max_delay must be >= interval"));
            }
        }
        Ok(())
    }

    /// Returns the base interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Returns `true` if another attempt may follow failed attempt `attempt`.
    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.interval_ms as f64 * self.backoff_rate.powi(exponent);
        let capped = match self.max_delay_ms {
            Some(max) => millis.min(max as f64),
            None => millis,
        };
        Duration::from_millis(capped as u64)
    }
}
