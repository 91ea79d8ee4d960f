//! Workflow instance records.

use crate::step::StepName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a workflow instance.
///
/// Transitions are monotonic: `pending -> running -> {completed, failed,
/// cancelled}`. A pending instance may also end directly (e.g. cancelled
/// or failed before its first step). Terminal statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Returns `true` for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Returns `true` if a record in `self` may be moved to `next`.
    ///
    /// Writing the current status again is allowed for non-terminal states
    /// so that progress updates can restate it.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Pending, _) => true,
            (Running, Pending) => false,
            (Running, _) => true,
            _ => false,
        }
    }

    /// Returns the lowercase name used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Globally unique id (UUIDv7, time-sortable).
    pub id: Uuid,
    /// Name of the definition this instance runs.
    pub workflow_name: String,
    /// Input passed to `start()`.
    pub input: Value,
    pub status: InstanceStatus,
    /// Latest step output; the final output once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step currently executing, or the last one that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepName>,
    /// Values written by handlers through `set_metadata`.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Creates a pending instance with a fresh id.
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            input,
            status: InstanceStatus::Pending,
            output: None,
            error: None,
            current_step: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Applies a partial update in place.
    ///
    /// Does not check the status transition; stores call
    /// [`InstanceStatus::can_transition_to`] first.
    pub fn apply(&mut self, update: InstanceUpdate) {
        let now = Utc::now();
        if let Some(status) = update.status {
            if status == InstanceStatus::Running && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            self.status = status;
        }
        if let Some(output) = update.output {
            self.output = Some(output);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(step) = update.current_step {
            self.current_step = Some(step);
        }
        if let Some(metadata) = update.metadata {
            self.metadata.extend(metadata);
        }
        self.updated_at = now;
    }
}

/// A partial update to an instance record. `None` fields are left as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub current_step: Option<StepName>,
    /// Merged into the existing metadata map.
    pub metadata: Option<HashMap<String, Value>>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn current_step(mut self, step: impl Into<StepName>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Query filter for listing instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub workflow_name: Option<String>,
    pub status: Option<InstanceStatus>,
    pub limit: Option<usize>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `instance` satisfies the name and status filters.
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.workflow_name
            .as_deref()
            .map_or(true, |name| instance.workflow_name == name)
            && self.status.map_or(true, |status| instance.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use InstanceStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(InstanceStatus::Cancelled).expect("serialize"),
            json!("cancelled")
        );
        assert_eq!(InstanceStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_apply_sets_timestamps_and_merges_metadata() {
        let mut instance = WorkflowInstance::new("orders", json!({"id": 1}));
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(instance.started_at.is_none());

        instance.apply(
            InstanceUpdate::new()
                .status(InstanceStatus::Running)
                .current_step("validate")
                .metadata(HashMap::from([("a".to_string(), json!(1))])),
        );
        assert!(instance.started_at.is_some());
        assert_eq!(instance.current_step, Some(StepName::new("validate")));

        instance.apply(
            InstanceUpdate::new()
                .status(InstanceStatus::Completed)
                .output(json!("done"))
                .metadata(HashMap::from([("b".to_string(), json!(2))])),
        );
        assert!(instance.completed_at.is_some());
        assert_eq!(instance.output, Some(json!("done")));
        assert_eq!(instance.metadata.len(), 2);
    }

    #[test]
    fn test_filter_matches() {
        let instance = WorkflowInstance::new("orders", Value::Null);
        assert!(InstanceFilter::new().matches(&instance));
        assert!(InstanceFilter::new().workflow("orders").matches(&instance));
        assert!(!InstanceFilter::new().workflow("billing").matches(&instance));
        assert!(!InstanceFilter::new()
            .status(InstanceStatus::Running)
            .matches(&instance));
    }
}
