//! Instance store contract.
//!
//! The engine persists every instance transition through [`InstanceStore`].
//! Any persistence technology satisfying this contract can back a service;
//! the runtime crate ships an in-memory implementation.

use crate::instance::{InstanceFilter, InstanceStatus, InstanceUpdate, WorkflowInstance};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by an [`InstanceStore`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// No instance exists with this id.
    #[error("Instance not found: {0}")]
    NotFound(Uuid),

    /// The update would move the instance out of a terminal status, or
    /// backwards.
    #[error("Instance {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// The underlying storage failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Persistence contract for workflow instances.
///
/// Implementations must apply each `update` atomically per instance id and
/// must reject status changes that [`InstanceStatus::can_transition_to`]
/// forbids. No multi-row transactions are required.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Persists a new `pending` instance.
    async fn create(&self, workflow_name: &str, input: Value)
        -> Result<WorkflowInstance, StoreError>;

    /// Loads an instance by id.
    async fn get(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Applies a partial update and returns the updated record.
    async fn update(&self, id: Uuid, update: InstanceUpdate)
        -> Result<WorkflowInstance, StoreError>;

    /// Lists instances matching `filter`. Ordering beyond insertion order is
    /// up to the implementation.
    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>, StoreError>;
}
