//! Step graph vocabulary: task, choice and parallel steps, plus the
//! auto-linking builder shared by workflows and parallel branches.

use crate::handler::{handler_fn, Condition, TaskHandler, Validator};
use ayatori_core::{RetryPolicy, StepContext, StepName, WorkflowError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Where control goes after a task or parallel step succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Continue to the named step.
    Next(StepName),
    /// The step is terminal; its output is the graph's output.
    End,
}

/// A step that invokes a handler.
pub struct TaskStep {
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub(crate) input_validator: Option<Validator>,
    pub(crate) output_validator: Option<Validator>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) next: Option<StepName>,
    pub(crate) end: bool,
    pub(crate) transition: Option<Transition>,
}

impl fmt::Debug for TaskStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStep")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("transition", &self.transition)
            .finish_non_exhaustive()
    }
}

impl TaskStep {
    pub fn new<H: TaskHandler + 'static>(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            input_validator: None,
            output_validator: None,
            retry: None,
            timeout: None,
            next: None,
            end: false,
            transition: None,
        }
    }

    /// Shorthand for `TaskStep::new(handler_fn(f))`.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        Self::new(handler_fn(f))
    }

    /// Continue to `step` instead of the next declared step.
    pub fn next(mut self, step: impl Into<StepName>) -> Self {
        self.next = Some(step.into());
        self
    }

    /// Make this step terminal.
    pub fn end(mut self) -> Self {
        self.end = true;
        self
    }

    /// Overrides the definition-level retry policy for this step.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Bounds how long each attempt's handler is awaited.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rejects the step input before the handler runs.
    pub fn input_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.input_validator = Some(Arc::new(f));
        self
    }

    /// Rejects the handler output before it is passed on.
    pub fn output_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.output_validator = Some(Arc::new(f));
        self
    }
}

pub(crate) struct ChoiceRule {
    pub(crate) condition: Condition,
    pub(crate) next: StepName,
}

/// A step that routes to the first rule whose condition holds.
///
/// Conditions see the running [`StepContext`]: `prev` plus instance
/// metadata. The step's input is passed through unchanged to the chosen
/// step.
#[derive(Default)]
pub struct ChoiceStep {
    pub(crate) rules: Vec<ChoiceRule>,
    pub(crate) default: Option<StepName>,
}

impl fmt::Debug for ChoiceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChoiceStep")
            .field(
                "targets",
                &self.rules.iter().map(|r| &r.next).collect::<Vec<_>>(),
            )
            .field("default", &self.default)
            .finish()
    }
}

impl ChoiceStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes to `next` when `condition` returns `true`.
    pub fn when<F>(self, condition: F, next: impl Into<StepName>) -> Self
    where
        F: Fn(&StepContext) -> bool + Send + Sync + 'static,
    {
        self.when_try(move |ctx| Ok(condition(ctx)), next)
    }

    /// Routes to `next` when `condition` returns `Ok(true)`. `Err` is no match.
    pub fn when_try<F>(mut self, condition: F, next: impl Into<StepName>) -> Self
    where
        F: Fn(&StepContext) -> Result<bool, WorkflowError> + Send + Sync + 'static,
    {
        self.rules.push(ChoiceRule {
            condition: Arc::new(condition),
            next: next.into(),
        });
        self
    }

    /// Routes to `next` when no condition matches.
    pub fn otherwise(mut self, next: impl Into<StepName>) -> Self {
        self.default = Some(next.into());
        self
    }
}

/// How a parallel step reacts to branch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelErrorPolicy {
    /// Fail on the first branch failure. Other branches keep running
    /// unmanaged; their results are discarded.
    #[default]
    FailFast,
    /// Wait for every branch, then fail with all branch errors if any failed.
    WaitAll,
}

/// A step that runs named branches concurrently and joins their outputs.
#[derive(Debug, Default)]
pub struct ParallelStep {
    pub(crate) branches: Vec<(String, Branch)>,
    pub(crate) on_error: ParallelErrorPolicy,
    pub(crate) next: Option<StepName>,
    pub(crate) end: bool,
    pub(crate) transition: Option<Transition>,
}

impl ParallelStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, name: impl Into<String>, branch: Branch) -> Self {
        self.branches.push((name.into(), branch));
        self
    }

    pub fn on_error(mut self, policy: ParallelErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn next(mut self, step: impl Into<StepName>) -> Self {
        self.next = Some(step.into());
        self
    }

    pub fn end(mut self) -> Self {
        self.end = true;
        self
    }
}

/// One node of a step graph.
#[derive(Debug)]
pub enum Step {
    Task(TaskStep),
    Choice(ChoiceStep),
    Parallel(ParallelStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Task(_) => "task",
            Step::Choice(_) => "choice",
            Step::Parallel(_) => "parallel",
        }
    }
}

/// An immutable, validated graph of named steps.
#[derive(Debug)]
pub struct StepGraph {
    steps: HashMap<StepName, Step>,
    order: Vec<StepName>,
    start_at: StepName,
}

impl StepGraph {
    pub fn start_at(&self) -> &StepName {
        &self.start_at
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Step names in declaration order.
    pub fn step_names(&self) -> impl Iterator<Item = &StepName> {
        self.order.iter()
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// A self-contained step graph run as one arm of a parallel step.
#[derive(Debug, Clone)]
pub struct Branch(pub(crate) Arc<StepGraph>);

impl Branch {
    pub fn builder() -> BranchBuilder {
        BranchBuilder::new()
    }

    pub fn graph(&self) -> &StepGraph {
        &self.0
    }
}

/// Ordered step declarations, resolved into a [`StepGraph`] by `build`.
#[derive(Debug, Default)]
pub(crate) struct GraphBuilder {
    entries: Vec<(StepName, Step)>,
    start_at: Option<StepName>,
}

impl GraphBuilder {
    pub(crate) fn push(&mut self, name: StepName, step: Step) {
        self.entries.push((name, step));
    }

    pub(crate) fn start_at(&mut self, name: StepName) {
        self.start_at = Some(name);
    }

    pub(crate) fn build(self) -> Result<StepGraph, WorkflowError> {
        let names: Vec<StepName> = self.entries.iter().map(|(name, _)| name.clone()).collect();
        let first = names.first().cloned().ok_or_else(|| {
            WorkflowError::Configuration("a step graph needs at least one step".to_string())
        })?;

        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name) {
                return Err(WorkflowError::Configuration(format!(
                    "duplicate step name: {}",
                    name
                )));
            }
        }

        let mut steps = HashMap::with_capacity(self.entries.len());
        for (index, (name, mut step)) in self.entries.into_iter().enumerate() {
            let following = names.get(index + 1);
            match &mut step {
                Step::Task(task) => {
                    task.transition = Some(link(&name, task.next.take(), task.end, following)?);
                    if let Some(policy) = &task.retry {
                        policy.validate().map_err(|e| {
                            WorkflowError::Configuration(format!(
                                "invalid retry policy for step {}: {}",
                                name, e
                            ))
                        })?;
                    }
                }
                Step::Parallel(parallel) => {
                    parallel.transition =
                        Some(link(&name, parallel.next.take(), parallel.end, following)?);
                    validate_branches(&name, parallel)?;
                }
                Step::Choice(_) => {}
            }
            steps.insert(name, step);
        }

        let start_at = self.start_at.unwrap_or(first);
        if !steps.contains_key(&start_at) {
            return Err(WorkflowError::StepNotFound(start_at));
        }

        for step in steps.values() {
            for target in targets(step) {
                if !steps.contains_key(target) {
                    return Err(WorkflowError::StepNotFound(target.clone()));
                }
            }
        }

        Ok(StepGraph {
            steps,
            order: names,
            start_at,
        })
    }
}

fn link(
    name: &StepName,
    next: Option<StepName>,
    end: bool,
    following: Option<&StepName>,
) -> Result<Transition, WorkflowError> {
    match (next, end) {
        (Some(_), true) => Err(WorkflowError::Configuration(format!(
            "step {} declares both next and end",
            name
        ))),
        (Some(next), false) => Ok(Transition::Next(next)),
        (None, true) => Ok(Transition::End),
        (None, false) => Ok(following
            .map(|next| Transition::Next(next.clone()))
            .unwrap_or(Transition::End)),
    }
}

fn validate_branches(name: &StepName, parallel: &ParallelStep) -> Result<(), WorkflowError> {
    if parallel.branches.is_empty() {
        return Err(WorkflowError::Configuration(format!(
            "parallel step {} has no branches",
            name
        )));
    }
    let mut seen = HashSet::new();
    for (branch, _) in &parallel.branches {
        if !seen.insert(branch.as_str()) {
            return Err(WorkflowError::Configuration(format!(
                "duplicate branch name {} in parallel step {}",
                branch, name
            )));
        }
    }
    Ok(())
}

fn targets(step: &Step) -> Vec<&StepName> {
    match step {
        Step::Task(TaskStep {
            transition: Some(Transition::Next(next)),
            ..
        })
        | Step::Parallel(ParallelStep {
            transition: Some(Transition::Next(next)),
            ..
        }) => vec![next],
        Step::Choice(choice) => choice
            .rules
            .iter()
            .map(|rule| &rule.next)
            .chain(choice.default.iter())
            .collect(),
        _ => Vec::new(),
    }
}

/// Builder for a parallel [`Branch`].
///
/// Steps declared without `next` link to the following declared step; the
/// last one ends the branch.
///
/// ```
/// use ayatori::prelude::*;
/// use serde_json::{json, Value};
///
/// async fn fetch(_input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
///     Ok(json!({"result": "a"}))
/// }
///
/// let branch = Branch::builder()
///     .task("fetch", TaskStep::new(handler_fn(fetch)))
///     .build()
///     .expect("valid branch");
/// assert_eq!(branch.graph().start_at(), "fetch");
/// ```
#[derive(Debug, Default)]
pub struct BranchBuilder {
    graph: GraphBuilder,
}

impl BranchBuilder {
    pub fn new() -> Self {
        Self::default()
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

    /// Starts the branch somewhere other than its first declared step.
    pub fn start_at(mut self, name: impl Into<StepName>) -> Self {
        self.graph.start_at(name.into());
        self
    }

    pub fn build(self) -> Result<Branch, WorkflowError> {
        Ok(Branch(Arc::new(self.graph.build()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn noop(input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
        Ok(input)
    }

    fn task() -> TaskStep {
        TaskStep::from_fn(noop)
    }

    fn transition_of(graph: &StepGraph, name: &str) -> Option<Transition> {
        match graph.get(name) {
            Some(Step::Task(task)) => task.transition.clone(),
            Some(Step::Parallel(parallel)) => parallel.transition.clone(),
            _ => None,
        }
    }

    #[test]
    fn test_auto_linking_follows_declaration_order() {
        let branch = Branch::builder()
            .task("a", task())
            .task("b", task())
            .task("c", task())
            .build()
            .expect("valid branch");
        let graph = branch.graph();

        assert_eq!(graph.start_at(), "a");
        assert_eq!(transition_of(graph, "a"), Some(Transition::Next("b".into())));
        assert_eq!(transition_of(graph, "b"), Some(Transition::Next("c".into())));
        assert_eq!(transition_of(graph, "c"), Some(Transition::End));
        assert_eq!(
            graph.step_names().map(|n| n.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_explicit_end_and_next_are_kept() {
        let branch = Branch::builder()
            .task("a", task().next("c"))
            .task("b", task().end())
            .task("c", task().next("b"))
            .build()
            .expect("valid branch");
        let graph = branch.graph();

        assert_eq!(transition_of(graph, "a"), Some(Transition::Next("c".into())));
        assert_eq!(transition_of(graph, "b"), Some(Transition::End));
        assert_eq!(transition_of(graph, "c"), Some(Transition::Next("b".into())));
    }

    #[test]
    fn test_rejects_unknown_targets() {
        let result = Branch::builder().task("a", task().next("missing")).build();
        assert!(matches!(result, Err(WorkflowError::StepNotFound(name)) if name == "missing"));

        let result = Branch::builder()
            .choice("route", ChoiceStep::new().when(|_| true, "nowhere"))
            .build();
        assert!(matches!(result, Err(WorkflowError::StepNotFound(_))));

        let result = Branch::builder()
            .task("a", task())
            .start_at("zzz")
            .build();
        assert!(matches!(result, Err(WorkflowError::StepNotFound(_))));
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        let result = Branch::builder().task("a", task()).task("a", task()).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(msg)) if msg.contains("duplicate step name")));

        let result = Branch::builder().build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));

        let result = Branch::builder().task("a", task().next("a").end()).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(msg)) if msg.contains("both next and end")));
    }

    #[test]
    fn test_parallel_branch_validation() {
        let leaf = || Branch::builder().task("x", task()).build().expect("valid branch");

        let result = Branch::builder().parallel("p", ParallelStep::new()).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(msg)) if msg.contains("no branches")));

        let result = Branch::builder()
            .parallel("p", ParallelStep::new().branch("a", leaf()).branch("a", leaf()))
            .build();
        assert!(matches!(result, Err(WorkflowError::Configuration(msg)) if msg.contains("duplicate branch name")));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let mut policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        policy.max_attempts = 0;
        let result = Branch::builder().task("a", task().retry(policy)).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(msg)) if msg.contains("max_attempts")));
    }

    #[test]
    fn test_choice_does_not_auto_link() {
        let branch = Branch::builder()
            .choice(
                "route",
                ChoiceStep::new()
                    .when(|ctx| ctx.prev() == &json!(1), "one")
                    .otherwise("other"),
            )
            .task("one", task().end())
            .task("other", task())
            .build()
            .expect("valid branch");
        assert_eq!(branch.graph().get("route").map(Step::kind), Some("choice"));
        assert_eq!(branch.graph().step_count(), 3);
    }
}
