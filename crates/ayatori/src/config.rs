//! Service-level configuration.

use ayatori_core::{RetryPolicy, WorkflowError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings applied across every workflow a service runs.
///
/// Deserializable so hosts can load it from their own configuration files;
/// missing fields take their defaults.
///
/// ```
/// use ayatori::ServiceConfig;
///
/// let config: ServiceConfig = serde_json::from_str(
///     r#"{"default_retry": {"max_attempts": 3, "interval_ms": 100, "backoff_rate": 2.0}}"#,
/// )
/// .expect("valid config");
/// assert_eq!(config.event_capacity, 256);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Retry policy for task steps when neither the step nor its workflow
    /// declares one.
    pub default_retry: Option<RetryPolicy>,
    /// Handler timeout when neither the step nor its workflow declares one.
    pub default_timeout_ms: Option<u64>,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
    /// How often `wait_for` re-reads the store between events.
    pub wait_poll_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_retry: None,
            default_timeout_ms: None,
            event_capacity: 256,
            wait_poll_interval_ms: 25,
        }
    }
}

impl ServiceConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.event_capacity == 0 {
            return Err(WorkflowError::Configuration(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(policy) = &self.default_retry {
            policy.validate().map_err(|e| {
                WorkflowError::Configuration(format!("invalid default_retry: {}", e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.default_timeout(), None);
        assert_eq!(config.wait_poll_interval(), Duration::from_millis(25));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialize() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"default_timeout_ms": 1500}"#).expect("parse");
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_validation() {
        let config = ServiceConfig {
            event_capacity: 0,
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(WorkflowError::Configuration(_))));

        let config = ServiceConfig {
            default_retry: Some(RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::none()
            }),
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
