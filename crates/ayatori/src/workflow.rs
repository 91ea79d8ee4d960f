//! Workflow definitions and their builder.

use crate::graph::{ChoiceStep, GraphBuilder, ParallelStep, Step, StepGraph, TaskStep};
use ayatori_core::{RetryPolicy, StepName, WorkflowError};
use std::fmt;
use std::panic::Location;
use std::time::Duration;

/// Source location a definition was built at.
///
/// Recorded by [`WorkflowBuilder::build`] and handed to the isolated-execution
/// collaborator unless registration supplies an explicit module path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// An immutable, named workflow.
///
/// Built once with [`Workflow::builder`], then registered with a
/// [`WorkflowService`](crate::WorkflowService).
#[derive(Debug)]
pub struct Workflow {
    name: String,
    graph: StepGraph,
    isolated: bool,
    default_retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    source: SourceRef,
}

impl Workflow {
    /// Creates a new workflow builder.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Returns the name of the start step.
    pub fn start_step(&self) -> &StepName {
        self.graph.start_at()
    }

    /// Returns `true` if instances must run out of process.
    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Retry policy for task steps that declare none.
    pub fn default_retry(&self) -> Option<&RetryPolicy> {
        self.default_retry.as_ref()
    }

    /// Handler timeout for task steps that declare none.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }
}

/// Builder for [`Workflow`].
///
/// Steps are kept in declaration order. A task or parallel step without an
/// explicit `next` links to the step declared after it; the last declared
/// step ends the workflow unless it names a `next`.
///
/// ```
/// use ayatori::prelude::*;
/// use serde_json::{json, Value};
///
/// async fn first(_input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
///     Ok(json!({"order": 1}))
/// }
///
/// async fn second(_input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
///     Ok(json!({"order": 2, "prev": ctx.prev()}))
/// }
///
/// let workflow = Workflow::builder("seq")
///     .task("first", TaskStep::from_fn(first))
///     .task("second", TaskStep::from_fn(second))
///     .build()
///     .expect("valid workflow");
///
/// assert_eq!(workflow.start_step(), "first");
/// assert!(!workflow.is_isolated());
/// ```
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    graph: GraphBuilder,
    isolated: bool,
    default_retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: GraphBuilder::default(),
            isolated: false,
            default_retry: None,
            timeout: None,
        }
    }

    pub fn task(mut self, name: impl Into<StepName>, step: TaskStep) -> Self {
        self.graph.push(name.into(), Step::Task(step));
        self
    }

    pub fn choice(mut self, name: impl Into<StepName>, step: ChoiceStep) -> Self {
        self.graph.push(name.into(), Step::Choice(step));
        self
    }

    pub fn parallel(mut self, name: impl Into<StepName>, step: ParallelStep) -> Self {
        self.graph.push(name.into(), Step::Parallel(step));
        self
    }

    /// Starts somewhere other than the first declared step.
    pub fn start_at(mut self, name: impl Into<StepName>) -> Self {
        self.graph.start_at(name.into());
        self
    }

    /// Marks instances of this workflow for out-of-process execution.
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the workflow, recording the caller's source location.
    #[track_caller]
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let caller = Location::caller();
        let source = SourceRef {
            file: caller.file(),
            line: caller.line(),
        };

        if self.name.trim().is_empty() {
            return Err(WorkflowError::Configuration(
                "workflow name must not be empty".to_string(),
            ));
        }
        if let Some(policy) = &self.default_retry {
            policy.validate().map_err(|e| {
                WorkflowError::Configuration(format!(
                    "invalid default retry policy for workflow {}: {}",
                    self.name, e
                ))
            })?;
        }

        let graph = self.graph.build()?;
        Ok(Workflow {
            name: self.name,
            graph,
            isolated: self.isolated,
            default_retry: self.default_retry,
            timeout: self.timeout,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ayatori_core::StepContext;
    use serde_json::Value;

    async fn noop(input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
        Ok(input)
    }

    #[test]
    fn test_build_records_caller_location() {
        let workflow = Workflow::builder("located")
            .task("only", TaskStep::from_fn(noop))
            .build()
            .expect("valid workflow");
        assert!(workflow.source().file.ends_with("workflow.rs"));
        assert!(workflow.source().line > 0);
        assert_eq!(
            workflow.source().to_string(),
            format!("{}:{}", workflow.source().file, workflow.source().line)
        );
    }

    #[test]
    fn test_builder_carries_definition_options() {
        let workflow = Workflow::builder("options")
            .task("only", TaskStep::from_fn(noop))
            .isolated(true)
            .default_retry(RetryPolicy::fixed(2, Duration::from_millis(5)))
            .timeout(Duration::from_secs(3))
            .build()
            .expect("valid workflow");
        assert_eq!(workflow.name(), "options");
        assert!(workflow.is_isolated());
        assert_eq!(workflow.default_retry().map(|p| p.max_attempts), Some(2));
        assert_eq!(workflow.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_workflow_builder_validation() {
        let result = Workflow::builder("").task("a", TaskStep::from_fn(noop)).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));

        let result = Workflow::builder("empty").build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }
}
