//! Execution context handed to step handlers and choice conditions.

use crate::error::WorkflowError;
use crate::step::StepName;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-instance metadata shared by every step, including parallel branches.
///
/// Cloning shares the underlying map. Writes are visible immediately to
/// later reads of the same instance.
#[derive(Debug, Clone, Default)]
pub struct Metadata(Arc<DashMap<String, Value>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies the current contents into a plain map for persistence.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.0
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl From<HashMap<String, Value>> for Metadata {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(Arc::new(map.into_iter().collect()))
    }
}

struct InstanceScope {
    instance_id: Uuid,
    workflow_name: String,
    workflow_input: Value,
    metadata: Metadata,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Context passed by value to every task handler and choice condition.
///
/// Cheap to clone: instance-wide state is shared behind an `Arc`.
///
/// # Examples
///
/// ```
/// use ayatori_core::{Metadata, StepContext};
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
/// use uuid::Uuid;
///
/// let ctx = StepContext::new(
///     Uuid::now_v7(),
///     "orders",
///     json!({"order_id": 7}),
///     Metadata::new(),
///     CancellationToken::new(),
/// )
/// .for_step("reserve", json!({"reserved": true}), 1);
///
/// ctx.set_metadata("reservation", json!("R-1"));
/// assert_eq!(ctx.get_metadata("reservation"), Some(json!("R-1")));
/// assert_eq!(ctx.prev(), &json!({"reserved": true}));
/// assert_eq!(ctx.workflow_input()["order_id"], 7);
/// ```
#[derive(Clone)]
pub struct StepContext {
    scope: Arc<InstanceScope>,
    step_name: StepName,
    prev: Value,
    attempt: u32,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("instance_id", &self.scope.instance_id)
            .field("workflow_name", &self.scope.workflow_name)
            .field("step_name", &self.step_name)
            .field("attempt", &self.attempt)
            .field("metadata_keys", &self.scope.metadata.len())
            .finish()
    }
}

impl StepContext {
    /// Creates the instance-wide context. Step-specific fields start empty;
    /// use [`for_step`](Self::for_step) to derive a context for one step.
    pub fn new(
        instance_id: Uuid,
        workflow_name: impl Into<String>,
        workflow_input: Value,
        metadata: Metadata,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scope: Arc::new(InstanceScope {
                instance_id,
                workflow_name: workflow_name.into(),
                workflow_input,
                metadata,
                cancel,
                started_at: Instant::now(),
            }),
            step_name: StepName::new(""),
            prev: Value::Null,
            attempt: 0,
        }
    }

    /// Derives a context for one attempt of one step, sharing instance state.
    pub fn for_step(&self, step_name: impl Into<StepName>, prev: Value, attempt: u32) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
            step_name: step_name.into(),
            prev,
            attempt,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.scope.instance_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.scope.workflow_name
    }

    pub fn step_name(&self) -> &StepName {
        &self.step_name
    }

    /// Attempt number of the current step, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Output of the previous step.
    ///
    /// `null` for the first step of a workflow. For the first step of a
    /// parallel branch, the parallel step's input.
    pub fn prev(&self) -> &Value {
        &self.prev
    }

    /// The input the instance was started with.
    pub fn workflow_input(&self) -> &Value {
        &self.scope.workflow_input
    }

    /// Writes an instance-wide metadata value.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.scope.metadata.set(key, value);
    }

    /// Reads an instance-wide metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.scope.metadata.get(key)
    }

    /// Reads and deserializes a metadata value.
    ///
    /// Returns `None` if the key is missing or the value has another shape.
    pub fn get_metadata_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_metadata(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.scope.metadata
    }

    /// Copy of every metadata entry written so far.
    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.scope.metadata.snapshot()
    }

    /// Returns `true` once the instance has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.scope.cancel.is_cancelled()
    }

    /// Token that fires when the instance is cancelled, for handlers that
    /// want to stop early.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.scope.cancel
    }

    /// Builds a [`WorkflowError::StepError`] for the current step.
    pub fn error(&self, details: impl Into<String>) -> WorkflowError {
        WorkflowError::StepError {
            step_name: self.step_name.clone(),
            details: details.into(),
        }
    }

    /// Time elapsed since the instance started executing.
    pub fn elapsed(&self) -> std::time::Duration {
        self.scope.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> StepContext {
        StepContext::new(
            Uuid::now_v7(),
            "wf",
            json!({"seed": 1}),
            Metadata::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_metadata_shared_between_steps() {
        let root = context();
        let first = root.for_step("first", Value::Null, 1);
        let second = root.for_step("second", json!({"order": 1}), 1);

        first.set_metadata("token", json!({"value": "abc"}));
        assert_eq!(second.get_metadata("token"), Some(json!({"value": "abc"})));
        assert_eq!(second.get_metadata("missing"), None);
        assert_eq!(root.metadata_snapshot().len(), 1);
    }

    #[test]
    fn test_get_metadata_as() {
        let ctx = context().for_step("s", Value::Null, 1);
        ctx.set_metadata("count", json!(3));
        assert_eq!(ctx.get_metadata_as::<u32>("count"), Some(3));
        assert_eq!(ctx.get_metadata_as::<String>("count"), None);
    }

    #[test]
    fn test_metadata_snapshot_and_from() {
        let metadata = Metadata::from(HashMap::from([("a".to_string(), json!(1))]));
        metadata.set("b", json!(2));
        let snapshot = metadata.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["b"], json!(2));
    }

    #[test]
    fn test_cancellation_visible() {
        let ctx = context().for_step("s", Value::Null, 1);
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_error_names_step() {
        let ctx = context().for_step("charge", Value::Null, 2);
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(
            ctx.error("declined").to_string(),
            "Step failed: charge, details: declined"
        );
    }
}
