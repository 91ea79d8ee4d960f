//! Workflow error types.

use crate::step::StepName;
use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// A single failed branch of a parallel step.
#[derive(Debug)]
pub struct BranchFailure {
    /// Name of the branch within its parallel step.
    pub branch: String,
    /// The error the branch terminated with.
    pub error: WorkflowError,
}

fn summarize(failures: &[BranchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.branch, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while defining, registering or running workflows.
///
/// Step-level variants ([`StepError`](Self::StepError),
/// [`Validation`](Self::Validation), [`Timeout`](Self::Timeout)) are
/// retried according to the step's retry policy. Routing, aggregate and
/// configuration errors are not.
///
/// ```
/// use ayatori_core::{StepName, WorkflowError};
///
/// fn describe(error: &WorkflowError) -> String {
///     match error {
///         WorkflowError::StepError { step_name, details } => {
///             format!("step {} failed: {}", step_name, details)
///         }
///         WorkflowError::NoChoiceMatched { step_name } => {
///             format!("routing dead end at {}", step_name)
///         }
///         other => other.to_string(),
///     }
/// }
///
/// let error = WorkflowError::StepError {
///     step_name: StepName::new("charge"),
///     details: "card declined".to_string(),
/// };
/// assert_eq!(describe(&error), "step charge failed: card declined");
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A task handler returned an error.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// An input or output validator rejected a value.
    #[error("Validation failed in step {step_name}: {details}")]
    Validation {
        /// The name of the step whose validator rejected the value.
        step_name: StepName,
        /// The validator's message.
        details: String,
    },

    /// A handler exceeded its timeout.
    #[error("Timeout occurred in step: {step_name}")]
    Timeout {
        /// The name of the step that timed out.
        step_name: StepName,
    },

    /// A referenced step was not found in the graph.
    #[error("Step not found: {0}")]
    StepNotFound(StepName),

    /// A choice step had no matching condition and no default.
    #[error("Step {step_name}: no choice condition matched")]
    NoChoiceMatched {
        /// The choice step that could not route.
        step_name: StepName,
    },

    /// A branch failed under the fail-fast policy.
    #[error("Branch '{branch}' of parallel step '{step_name}' failed: {source}")]
    BranchFailed {
        /// The parallel step.
        step_name: StepName,
        /// The first branch to fail.
        branch: String,
        /// The branch's own error.
        #[source]
        source: Box<WorkflowError>,
    },

    /// One or more branches failed under the wait-all policy.
    #[error(
        "Parallel step '{step_name}' failed in {} branch(es): {}",
        .failures.len(),
        summarize(.failures)
    )]
    ParallelFailed {
        /// The parallel step.
        step_name: StepName,
        /// Every failed branch, in declaration order.
        failures: Vec<BranchFailure>,
    },

    /// The instance was cancelled.
    #[error("Workflow instance cancelled")]
    Cancelled,

    /// The workflow or service configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),

    /// A definition with this name is already registered.
    #[error("Workflow already registered: {0}")]
    AlreadyRegistered(String),

    /// No definition with this name is registered.
    #[error("Workflow not registered: {0}")]
    NotRegistered(String),

    /// The isolated-execution collaborator refused a run.
    #[error("Isolated dispatch failed: {0}")]
    Dispatch(String),

    /// The instance did not reach a terminal status in time.
    #[error("Timed out waiting for instance {0}")]
    WaitTimeout(Uuid),

    /// The instance store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Returns `true` if a task retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::StepError { .. }
                | WorkflowError::Validation { .. }
                | WorkflowError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::StepError {
            step_name: StepName::new("test_step"),
            details: "test error".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Step failed: test_step, details: test error"
        );
    }

    #[test]
    fn test_no_choice_matched_display() {
        let error = WorkflowError::NoChoiceMatched {
            step_name: StepName::new("route"),
        };
        assert!(error.to_string().contains("no choice condition matched"));
    }

    #[test]
    fn test_parallel_failed_names_every_branch() {
        let error = WorkflowError::ParallelFailed {
            step_name: StepName::new("fan_out"),
            failures: vec![
                BranchFailure {
                    branch: "a".to_string(),
                    error: WorkflowError::StepError {
                        step_name: StepName::new("a1"),
                        details: "boom a".to_string(),
                    },
                },
                BranchFailure {
                    branch: "b".to_string(),
                    error: WorkflowError::Timeout {
                        step_name: StepName::new("b1"),
                    },
                },
            ],
        };
        let message = error.to_string();
        assert!(message.starts_with("Parallel step 'fan_out' failed in 2 branch(es)"));
        assert!(message.contains("a: Step failed: a1, details: boom a"));
        assert!(message.contains("b: Timeout occurred in step: b1"));
    }

    #[test]
    fn test_branch_failed_keeps_source() {
        let error = WorkflowError::BranchFailed {
            step_name: StepName::new("fan_out"),
            branch: "a".to_string(),
            source: Box::new(WorkflowError::StepError {
                step_name: StepName::new("a1"),
                details: "boom".to_string(),
            }),
        };
        assert_eq!(
            error.to_string(),
            "Branch 'a' of parallel step 'fan_out' failed: Step failed: a1, details: boom"
        );
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(WorkflowError::Timeout {
            step_name: StepName::new("s")
        }
        .is_retryable());
        assert!(!WorkflowError::NoChoiceMatched {
            step_name: StepName::new("s")
        }
        .is_retryable());
        assert!(!WorkflowError::Cancelled.is_retryable());
        assert!(!WorkflowError::Configuration("bad".to_string()).is_retryable());
    }
}
