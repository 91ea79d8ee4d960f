//! Core types and contracts for the ayatori workflow engine.
//!
//! This crate holds the vocabulary shared by the runtime and by anything
//! that plugs into it, such as custom instance stores or step handlers
//! published as libraries.
//!
//! # Core Types
//!
//! - [`StepName`] - Type-safe step identifier
//! - [`RetryPolicy`] - Attempts, interval and backoff rate for task steps
//! - [`StepContext`] - What a handler sees: `prev`, metadata, cancellation
//! - [`WorkflowInstance`] - One persisted execution run
//! - [`InstanceStore`] - Persistence contract for instances
//! - [`WorkflowError`] - Error taxonomy for definition, routing and execution

mod context;
mod error;
mod instance;
mod step;
mod store;

pub use context::{Metadata, StepContext};
pub use error::{BranchFailure, WorkflowError};
pub use instance::{InstanceFilter, InstanceStatus, InstanceUpdate, WorkflowInstance};
pub use step::{RetryPolicy, RetryPolicyError, StepName};
pub use store::{InstanceStore, StoreError};
