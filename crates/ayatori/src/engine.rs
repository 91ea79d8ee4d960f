//! Execution engine: walks a step graph for one instance.

use crate::event::WorkflowEvent;
use crate::graph::{
    ChoiceStep, ParallelErrorPolicy, ParallelStep, Step, StepGraph, TaskStep, Transition,
};
use crate::workflow::Workflow;
use ayatori_core::{
    BranchFailure, InstanceStatus, InstanceStore, InstanceUpdate, Metadata, RetryPolicy,
    StepContext, StepName, StoreError, WorkflowError, WorkflowInstance,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Fallbacks used when neither a task nor its workflow configures a value.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepDefaults {
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
}

/// Why a graph walk stopped without producing an output.
#[derive(Debug)]
enum Interrupt {
    Failed(WorkflowError),
    Cancelled,
    /// The service was stopped while a retry delay was pending.
    Shutdown,
}

impl From<WorkflowError> for Interrupt {
    fn from(error: WorkflowError) -> Self {
        Interrupt::Failed(error)
    }
}

impl From<StoreError> for Interrupt {
    fn from(error: StoreError) -> Self {
        Interrupt::Failed(error.into())
    }
}

/// What a successful step tells the loop to do next.
enum Advance {
    /// A task or parallel step produced an output.
    Produced {
        output: Value,
        next: Option<StepName>,
    },
    /// A choice step picked a route; input and `prev` carry over.
    Routed(StepName),
}

/// State shared by every step of one instance, including branch tasks.
#[derive(Clone)]
struct RunScope {
    workflow: Arc<Workflow>,
    ctx: StepContext,
}

impl RunScope {
    fn instance_id(&self) -> Uuid {
        self.ctx.instance_id()
    }
}

#[derive(Clone)]
pub(crate) struct Engine {
    store: Arc<dyn InstanceStore>,
    events: broadcast::Sender<WorkflowEvent>,
    shutdown: CancellationToken,
    defaults: StepDefaults,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn InstanceStore>,
        events: broadcast::Sender<WorkflowEvent>,
        shutdown: CancellationToken,
        defaults: StepDefaults,
    ) -> Self {
        Self {
            store,
            events,
            shutdown,
            defaults,
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Runs a pending instance to a terminal status.
    #[instrument(
        name = "workflow_run",
        skip_all,
        fields(instance_id = %instance.id, workflow = %workflow.name())
    )]
    pub(crate) async fn run(
        &self,
        workflow: Arc<Workflow>,
        instance: WorkflowInstance,
        cancel: CancellationToken,
    ) {
        let id = instance.id;
        let start = workflow.start_step().clone();
        let started = self
            .store
            .update(
                id,
                InstanceUpdate::new()
                    .status(InstanceStatus::Running)
                    .current_step(start),
            )
            .await;
        if let Err(e) = started {
            warn!("Instance {} could not start: {}", id, e);
            return;
        }

        info!("Workflow '{}' instance {} started", workflow.name(), id);
        self.emit(WorkflowEvent::InstanceStarted {
            instance_id: id,
            workflow: workflow.name().to_string(),
        });

        let ctx = StepContext::new(
            id,
            workflow.name(),
            instance.input.clone(),
            Metadata::from(instance.metadata),
            cancel,
        );
        let scope = RunScope {
            workflow: Arc::clone(&workflow),
            ctx,
        };

        let result = self
            .walk(&scope, workflow.graph(), instance.input, Value::Null, true)
            .await;
        self.finish(&scope, result).await;
    }

    async fn finish(&self, scope: &RunScope, result: Result<Value, Interrupt>) {
        let id = scope.instance_id();
        let metadata = scope.ctx.metadata_snapshot();

        match result {
            Ok(output) => {
                let update = InstanceUpdate::new()
                    .status(InstanceStatus::Completed)
                    .output(output)
                    .metadata(metadata);
                match self.store.update(id, update).await {
                    Ok(_) => {
                        info!("Instance {} completed", id);
                        self.emit(WorkflowEvent::InstanceCompleted { instance_id: id });
                    }
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        debug!("Instance {} finished after becoming {}", id, from);
                    }
                    Err(e) => error!("Failed to persist completion of {}: {}", id, e),
                }
            }
            Err(Interrupt::Failed(_)) | Err(Interrupt::Cancelled) if scope.ctx.is_cancelled() => {
                info!("Instance {} stopped after cancellation", id);
            }
            Err(Interrupt::Failed(failure)) => {
                let message = failure.to_string();
                error!("Instance {} failed: {}", id, message);
                let update = InstanceUpdate::new()
                    .status(InstanceStatus::Failed)
                    .error(message.clone())
                    .metadata(metadata);
                match self.store.update(id, update).await {
                    Ok(_) => self.emit(WorkflowEvent::InstanceFailed {
                        instance_id: id,
                        error: message,
                    }),
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        debug!("Instance {} failed after becoming {}", id, from);
                    }
                    Err(e) => error!("Failed to persist failure of {}: {}", id, e),
                }
            }
            Err(Interrupt::Cancelled) => {
                info!("Instance {} stopped after cancellation", id);
            }
            Err(Interrupt::Shutdown) => {
                warn!("Service stopped; instance {} left running", id);
            }
        }
    }

    /// Walks `graph` from its start step until a terminal step.
    ///
    /// Only the top-level walk persists progress; branch walks report
    /// through their parallel step.
    fn walk<'a>(
        &'a self,
        scope: &'a RunScope,
        graph: &'a StepGraph,
        input: Value,
        prev: Value,
        top_level: bool,
    ) -> BoxFuture<'a, Result<Value, Interrupt>> {
        Box::pin(async move {
            let id = scope.instance_id();
            let mut current = graph.start_at().clone();
            let mut input = input;
            let mut prev = prev;

            loop {
                if scope.ctx.is_cancelled() {
                    return Err(Interrupt::Cancelled);
                }
                let step = graph
                    .get(current.as_str())
                    .ok_or_else(|| WorkflowError::StepNotFound(current.clone()))?;

                if top_level {
                    self.store
                        .update(id, InstanceUpdate::new().current_step(&current))
                        .await?;
                }
                debug!("Step '{}' ({}) started", current, step.kind());
                self.emit(WorkflowEvent::StepStarted {
                    instance_id: id,
                    step: current.clone(),
                });

                let advance = match step {
                    Step::Task(task) => self
                        .run_task(scope, &current, task, input.clone(), prev.clone())
                        .await
                        .map(|output| Advance::Produced {
                            output,
                            next: next_of(&task.transition),
                        }),
                    Step::Choice(choice) => self.route(scope, &current, choice, &prev).map(Advance::Routed),
                    Step::Parallel(parallel) => self
                        .run_parallel(scope, &current, parallel, input.clone())
                        .await
                        .map(|output| Advance::Produced {
                            output,
                            next: next_of(&parallel.transition),
                        }),
                };

                let advance = match advance {
                    Ok(advance) => advance,
                    Err(Interrupt::Failed(error)) => {
                        warn!("Step '{}' failed: {}", current, error);
                        self.emit(WorkflowEvent::StepFailed {
                            instance_id: id,
                            step: current.clone(),
                            error: error.to_string(),
                        });
                        return Err(Interrupt::Failed(error));
                    }
                    Err(other) => return Err(other),
                };

                info!("Step '{}' completed successfully", current);
                self.emit(WorkflowEvent::StepCompleted {
                    instance_id: id,
                    step: current.clone(),
                });

                match advance {
                    Advance::Routed(next) => {
                        if top_level {
                            self.persist_metadata(scope).await?;
                        }
                        current = next;
                    }
                    Advance::Produced { output, next } => {
                        let Some(next) = next else {
                            return Ok(output);
                        };
                        if top_level {
                            let update = InstanceUpdate::new()
                                .output(output.clone())
                                .metadata(scope.ctx.metadata_snapshot());
                            self.store.update(id, update).await?;
                        }
                        prev = output.clone();
                        input = output;
                        current = next;
                    }
                }
            }
        })
    }

    async fn persist_metadata(&self, scope: &RunScope) -> Result<(), StoreError> {
        let update = InstanceUpdate::new().metadata(scope.ctx.metadata_snapshot());
        self.store.update(scope.instance_id(), update).await?;
        Ok(())
    }

    async fn run_task(
        &self,
        scope: &RunScope,
        name: &StepName,
        task: &TaskStep,
        input: Value,
        prev: Value,
    ) -> Result<Value, Interrupt> {
        let policy = task
            .retry
            .as_ref()
            .or(scope.workflow.default_retry())
            .or(self.defaults.retry.as_ref())
            .cloned()
            .unwrap_or_default();
        let limit = task
            .timeout
            .or(scope.workflow.timeout())
            .or(self.defaults.timeout);

        let mut attempt = 1;
        loop {
            let ctx = scope.ctx.for_step(name, prev.clone(), attempt);
            let error = match self.attempt_task(name, task, input.clone(), ctx, limit).await {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };

            if matches!(error, WorkflowError::Cancelled) && scope.ctx.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            if !error.is_retryable() || !policy.has_attempts_after(attempt) {
                if attempt > 1 {
                    warn!("Step '{}' failed after {} attempts", name, attempt);
                }
                return Err(Interrupt::Failed(error));
            }

            let delay = policy.delay_for_attempt(attempt);
            info!(
                "Step '{}' failed, retrying ({}/{}) in {:?}: {}",
                name,
                attempt + 1,
                policy.max_attempts,
                delay,
                error
            );
            self.emit(WorkflowEvent::StepRetrying {
                instance_id: scope.instance_id(),
                step: name.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Err(Interrupt::Shutdown),
                _ = scope.ctx.cancellation_token().cancelled() => return Err(Interrupt::Cancelled),
            }
            attempt += 1;
        }
    }

    async fn attempt_task(
        &self,
        name: &StepName,
        task: &TaskStep,
        input: Value,
        ctx: StepContext,
        limit: Option<Duration>,
    ) -> Result<Value, WorkflowError> {
        if let Some(validate) = &task.input_validator {
            validate(&input).map_err(|details| WorkflowError::Validation {
                step_name: name.clone(),
                details: format!("input rejected: {}", details),
            })?;
        }

        let handled = AssertUnwindSafe(task.handler.handle(input, ctx)).catch_unwind();
        let caught = match limit {
            Some(limit) => timeout(limit, handled)
                .await
                .map_err(|_| WorkflowError::Timeout {
                    step_name: name.clone(),
                })?,
            None => handled.await,
        };
        let output = caught.map_err(|payload| WorkflowError::StepError {
            step_name: name.clone(),
            details: format!("handler panicked: {}", panic_message(payload.as_ref())),
        })??;

        if let Some(validate) = &task.output_validator {
            validate(&output).map_err(|details| WorkflowError::Validation {
                step_name: name.clone(),
                details: format!("output rejected: {}", details),
            })?;
        }
        Ok(output)
    }

    fn route(
        &self,
        scope: &RunScope,
        name: &StepName,
        choice: &ChoiceStep,
        prev: &Value,
    ) -> Result<StepName, Interrupt> {
        let ctx = scope.ctx.for_step(name, prev.clone(), 1);
        for (index, rule) in choice.rules.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| (rule.condition)(&ctx))) {
                Ok(Ok(true)) => {
                    debug!("Choice '{}' matched condition {} -> '{}'", name, index, rule.next);
                    return Ok(rule.next.clone());
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    warn!("Choice '{}' condition {} errored, treating as no match: {}", name, index, e);
                }
                Err(_) => {
                    warn!("Choice '{}' condition {} panicked, treating as no match", name, index);
                }
            }
        }

        match &choice.default {
            Some(default) => {
                debug!("Choice '{}' fell through to default '{}'", name, default);
                Ok(default.clone())
            }
            None => Err(Interrupt::Failed(WorkflowError::NoChoiceMatched {
                step_name: name.clone(),
            })),
        }
    }

    async fn run_parallel(
        &self,
        scope: &RunScope,
        name: &StepName,
        parallel: &ParallelStep,
        input: Value,
    ) -> Result<Value, Interrupt> {
        let mut pending: FuturesUnordered<_> = parallel
            .branches
            .iter()
            .enumerate()
            .map(|(index, (branch_name, branch))| {
                let engine = self.clone();
                let scope = scope.clone();
                let branch = branch.clone();
                let input = input.clone();
                let handle = tokio::spawn(async move {
                    engine
                        .walk(&scope, branch.graph(), input.clone(), input, false)
                        .await
                });
                // Dropping the handle detaches the task rather than aborting it.
                let branch_name = branch_name.clone();
                async move { (index, branch_name, handle.await) }
            })
            .collect();

        let mut outputs: Vec<(usize, String, Value)> = Vec::with_capacity(parallel.branches.len());
        let mut failures: Vec<(usize, BranchFailure)> = Vec::new();

        while let Some((index, branch, joined)) = pending.next().await {
            let result = joined.unwrap_or_else(|join_error| {
                Err(Interrupt::Failed(WorkflowError::StepError {
                    step_name: name.clone(),
                    details: format!("branch '{}' task aborted: {}", branch, join_error),
                }))
            });

            match result {
                Ok(output) => {
                    debug!("Branch '{}' of '{}' completed", branch, name);
                    outputs.push((index, branch, output));
                }
                Err(Interrupt::Failed(error)) => match parallel.on_error {
                    ParallelErrorPolicy::FailFast => {
                        return Err(Interrupt::Failed(WorkflowError::BranchFailed {
                            step_name: name.clone(),
                            branch,
                            source: Box::new(error),
                        }));
                    }
                    ParallelErrorPolicy::WaitAll => {
                        warn!("Branch '{}' of '{}' failed: {}", branch, name, error);
                        failures.push((index, BranchFailure { branch, error }));
                    }
                },
                Err(other) => return Err(other),
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|(index, _)| *index);
            return Err(Interrupt::Failed(WorkflowError::ParallelFailed {
                step_name: name.clone(),
                failures: failures.into_iter().map(|(_, failure)| failure).collect(),
            }));
        }

        outputs.sort_by_key(|(index, _, _)| *index);
        let joined: Map<String, Value> = outputs
            .into_iter()
            .map(|(_, branch, output)| (branch, output))
            .collect();
        Ok(Value::Object(joined))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn next_of(transition: &Option<Transition>) -> Option<StepName> {
    match transition {
        Some(Transition::Next(next)) => Some(next.clone()),
        Some(Transition::End) | None => None,
    }
}
