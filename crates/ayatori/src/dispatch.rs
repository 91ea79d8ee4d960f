//! Out-of-process execution contract.
//!
//! The engine never spawns processes. For workflows marked isolated, the
//! service hands an [`IsolatedRun`] to an [`IsolatedDispatcher`], which is
//! expected to run the definition elsewhere and report status back through
//! the same [`InstanceStore`](ayatori_core::InstanceStore).

use async_trait::async_trait;
use ayatori_core::WorkflowError;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Everything an out-of-process runner needs to execute one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolatedRun {
    /// Where the definition lives: the registration override, or the
    /// source location recorded at build time.
    pub module_path: String,
    pub workflow_name: String,
    pub instance_id: Uuid,
    pub input: Value,
}

/// Dispatches isolated workflow instances to a process supervisor.
///
/// Implementations own spawning, IPC and heartbeats, and must surface
/// crashes as failed instances in the store.
#[async_trait]
pub trait IsolatedDispatcher: Send + Sync {
    async fn dispatch(&self, run: IsolatedRun) -> Result<(), WorkflowError>;
}
