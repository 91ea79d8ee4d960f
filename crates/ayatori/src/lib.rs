//! A durable workflow engine for Rust.
//!
//! Workflows are graphs of named steps: tasks that call a handler, choices
//! that route on the previous output and parallel steps that fan out into
//! branches and join their outputs. A [`WorkflowService`] registers
//! definitions, starts instances, persists their progress through an
//! [`InstanceStore`] and lets callers cancel and query them.
//!
//! # Example
//!
//! ```rust
//! use ayatori::prelude::*;
//! use serde_json::{json, Value};
//! use std::time::Duration;
//!
//! async fn load(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
//!     ctx.set_metadata("source", input["source"].clone());
//!     Ok(json!({"rows": 3}))
//! }
//!
//! async fn report(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
//!     Ok(json!({"loaded": input["rows"], "from": ctx.get_metadata("source")}))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkflowError> {
//!     let service = WorkflowService::new();
//!     service.register(
//!         Workflow::builder("etl")
//!             .task("load", TaskStep::from_fn(load).retry(RetryPolicy::fixed(3, Duration::from_millis(10))))
//!             .task("report", TaskStep::from_fn(report))
//!             .build()?,
//!     )?;
//!
//!     let id = service.start("etl", json!({"source": "api"})).await?;
//!     let instance = service.wait_for(id, Duration::from_secs(5)).await?;
//!     assert_eq!(instance.output, Some(json!({"loaded": 3, "from": "api"})));
//!     Ok(())
//! }
//! ```

mod config;
mod dispatch;
mod engine;
mod event;
mod graph;
mod handler;
mod service;
mod store;
mod workflow;

// Re-export core types
pub use ayatori_core::*;

pub use config::ServiceConfig;
pub use dispatch::{IsolatedDispatcher, IsolatedRun};
pub use event::WorkflowEvent;
pub use graph::{
    Branch, BranchBuilder, ChoiceStep, ParallelErrorPolicy, ParallelStep, Step, StepGraph,
    TaskStep, Transition,
};
pub use handler::{handler_fn, Condition, FnHandler, TaskHandler, Validator};
pub use service::{RegisterOptions, WorkflowService, WorkflowServiceBuilder};
pub use store::MemoryStore;
pub use workflow::{SourceRef, Workflow, WorkflowBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        handler_fn, Branch, BranchBuilder, ChoiceStep, InstanceFilter, InstanceStatus,
        IsolatedDispatcher, IsolatedRun, MemoryStore, ParallelErrorPolicy, ParallelStep,
        RegisterOptions, RetryPolicy, ServiceConfig, StepContext, StepName, TaskHandler, TaskStep,
        Workflow, WorkflowBuilder, WorkflowError, WorkflowEvent, WorkflowInstance,
        WorkflowService,
    };
}
