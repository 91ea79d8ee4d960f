//! Registry of workflow definitions and the entry point for running them.

use crate::config::ServiceConfig;
use crate::dispatch::{IsolatedDispatcher, IsolatedRun};
use crate::engine::{Engine, StepDefaults};
use crate::event::WorkflowEvent;
use crate::store::MemoryStore;
use crate::workflow::Workflow;
use ayatori_core::{
    InstanceFilter, InstanceStatus, InstanceStore, InstanceUpdate, StoreError, WorkflowError,
    WorkflowInstance,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options accepted by [`WorkflowService::register_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Module reference handed to the isolated dispatcher. Takes precedence
    /// over the source location recorded when the workflow was built.
    pub module_path: Option<String>,
}

impl RegisterOptions {
    pub fn module_path(path: impl Into<String>) -> Self {
        Self {
            module_path: Some(path.into()),
        }
    }
}

#[derive(Clone)]
struct Registered {
    workflow: Arc<Workflow>,
    module_path: Option<String>,
}

/// Owns registered workflows and starts, cancels and queries their instances.
///
/// Inline workflows run on the current tokio runtime, one task per
/// instance. Isolated workflows are handed to the configured
/// [`IsolatedDispatcher`].
///
/// # Examples
///
/// ```
/// use ayatori::prelude::*;
/// use serde_json::{json, Value};
/// use std::time::Duration;
///
/// async fn first(_input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
///     Ok(json!({"order": 1}))
/// }
///
/// async fn second(_input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
///     Ok(json!({"order": 2, "prev": ctx.prev()}))
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), WorkflowError> {
/// let service = WorkflowService::new();
/// service.register(
///     Workflow::builder("seq")
///         .task("first", TaskStep::from_fn(first))
///         .task("second", TaskStep::from_fn(second))
///         .build()?,
/// )?;
///
/// let id = service.start("seq", json!({})).await?;
/// let instance = service.wait_for(id, Duration::from_secs(5)).await?;
/// assert_eq!(instance.status, InstanceStatus::Completed);
/// assert_eq!(instance.output, Some(json!({"order": 2, "prev": {"order": 1}})));
/// # Ok(())
/// # }
/// ```
pub struct WorkflowService {
    definitions: DashMap<String, Registered>,
    store: Arc<dyn InstanceStore>,
    dispatcher: Option<Arc<dyn IsolatedDispatcher>>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
    engine: Engine,
    events: broadcast::Sender<WorkflowEvent>,
    shutdown: CancellationToken,
    config: ServiceConfig,
}

impl fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowService")
            .field("workflows", &self.workflow_names())
            .field("running", &self.running.len())
            .field("isolated_dispatch", &self.dispatcher.is_some())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Default for WorkflowService {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowService {
    /// Creates a service backed by a [`MemoryStore`] with default settings.
    pub fn new() -> Self {
        Self::assemble(
            Arc::new(MemoryStore::new()),
            None,
            ServiceConfig::default(),
        )
    }

    pub fn builder() -> WorkflowServiceBuilder {
        WorkflowServiceBuilder::new()
    }

    fn assemble(
        store: Arc<dyn InstanceStore>,
        dispatcher: Option<Arc<dyn IsolatedDispatcher>>,
        config: ServiceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shutdown = CancellationToken::new();
        let engine = Engine::new(
            Arc::clone(&store),
            events.clone(),
            shutdown.clone(),
            StepDefaults {
                retry: config.default_retry.clone(),
                timeout: config.default_timeout(),
            },
        );
        Self {
            definitions: DashMap::new(),
            store,
            dispatcher,
            running: Arc::new(DashMap::new()),
            engine,
            events,
            shutdown,
            config,
        }
    }

    /// Registers a workflow under its name.
    pub fn register(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        self.register_with(workflow, RegisterOptions::default())
    }

    /// Registers a workflow with explicit options.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::AlreadyRegistered`] if the name is taken
    /// - [`WorkflowError::Configuration`] if the workflow is isolated but no
    ///   dispatcher is configured or the module path is empty
    pub fn register_with(
        &self,
        workflow: Workflow,
        options: RegisterOptions,
    ) -> Result<(), WorkflowError> {
        let name = workflow.name().to_string();
        match self.definitions.entry(name.clone()) {
            Entry::Occupied(_) => Err(WorkflowError::AlreadyRegistered(name)),
            Entry::Vacant(slot) => {
                let module_path = if workflow.is_isolated() {
                    if self.dispatcher.is_none() {
                        return Err(WorkflowError::Configuration(format!(
                            "workflow {} is isolated but no dispatcher is configured",
                            name
                        )));
                    }
                    let path = options
                        .module_path
                        .unwrap_or_else(|| workflow.source().file.to_string());
                    if path.trim().is_empty() {
                        return Err(WorkflowError::Configuration(format!(
                            "workflow {} is isolated but has no module path",
                            name
                        )));
                    }
                    Some(path)
                } else {
                    None
                };

                info!(
                    "Registered workflow '{}' ({} steps{})",
                    name,
                    workflow.graph().step_count(),
                    if workflow.is_isolated() { ", isolated" } else { "" }
                );
                slot.insert(Registered {
                    workflow: Arc::new(workflow),
                    module_path,
                });
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn definition(&self, name: &str) -> Option<Arc<Workflow>> {
        self.definitions
            .get(name)
            .map(|entry| Arc::clone(&entry.workflow))
    }

    /// Names of all registered workflows, sorted.
    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Creates a pending instance and schedules it, returning its id without
    /// waiting for it to run.
    ///
    /// Handler failures never surface here; they are recorded on the
    /// instance.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotRegistered`] for unknown names
    /// - [`WorkflowError::Configuration`] after [`stop`](Self::stop)
    /// - [`WorkflowError::Store`] if the instance cannot be persisted
    pub async fn start(&self, name: &str, input: Value) -> Result<Uuid, WorkflowError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkflowError::Configuration(
                "workflow service has been stopped".to_string(),
            ));
        }
        let registered = self
            .definitions
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WorkflowError::NotRegistered(name.to_string()))?;

        let instance = self.store.create(name, input).await?;
        let id = instance.id;

        if registered.workflow.is_isolated() {
            self.dispatch_isolated(registered, instance).await;
            return Ok(id);
        }

        let cancel = CancellationToken::new();
        self.running.insert(id, cancel.clone());
        let engine = self.engine.clone();
        let running = Arc::clone(&self.running);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move {
                engine.run(registered.workflow, instance, cancel).await;
            });
            if let Err(join_error) = run.await {
                let message = format!("instance task aborted: {}", join_error);
                error!("Instance {} crashed: {}", id, message);
                record_failure(store.as_ref(), &events, id, message).await;
            }
            running.remove(&id);
        });
        Ok(id)
    }

    async fn dispatch_isolated(&self, registered: Registered, instance: WorkflowInstance) {
        let id = instance.id;
        let outcome = match (&self.dispatcher, registered.module_path) {
            (Some(dispatcher), Some(module_path)) => {
                let run = IsolatedRun {
                    module_path,
                    workflow_name: instance.workflow_name,
                    instance_id: id,
                    input: instance.input,
                };
                dispatcher.dispatch(run).await
            }
            _ => Err(WorkflowError::Configuration(
                "isolated workflow has no dispatcher".to_string(),
            )),
        };

        match outcome {
            Ok(()) => info!("Dispatched isolated instance {}", id),
            Err(e) => {
                let message = e.to_string();
                error!("Isolated dispatch of {} failed: {}", id, message);
                record_failure(self.store.as_ref(), &self.events, id, message).await;
            }
        }
    }

    /// Cancels a running instance.
    ///
    /// Returns `true` if the instance was running and is now cancelled. The
    /// step in flight is not interrupted; no further step is scheduled.
    /// Returns `false` for unknown, pending or terminal instances.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, WorkflowError> {
        let Some(instance) = self.store.get(id).await? else {
            return Ok(false);
        };
        if instance.status != InstanceStatus::Running {
            return Ok(false);
        }

        match self
            .store
            .update(id, InstanceUpdate::new().status(InstanceStatus::Cancelled))
            .await
        {
            Ok(_) => {
                // The row is terminal before the loop is told to stop.
                if let Some(token) = self.running.get(&id) {
                    token.cancel();
                }
                info!("Instance {} cancelled", id);
                let _ = self
                    .events
                    .send(WorkflowEvent::InstanceCancelled { instance_id: id });
                Ok(true)
            }
            Err(StoreError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, WorkflowError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn get_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn get_all_instances(&self) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        self.get_instances(&InstanceFilter::default()).await
    }

    /// Waits until the instance reaches a terminal status.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::WaitTimeout`] if `limit` elapses first
    /// - [`WorkflowError::Store`] if the instance does not exist
    pub async fn wait_for(
        &self,
        id: Uuid,
        limit: Duration,
    ) -> Result<WorkflowInstance, WorkflowError> {
        tokio::time::timeout(limit, self.poll_until_terminal(id))
            .await
            .map_err(|_| WorkflowError::WaitTimeout(id))?
    }

    async fn poll_until_terminal(&self, id: Uuid) -> Result<WorkflowInstance, WorkflowError> {
        let mut events = self.events.subscribe();
        let poll = self.config.wait_poll_interval();
        loop {
            match self.store.get(id).await? {
                Some(instance) if instance.status.is_terminal() => return Ok(instance),
                Some(_) => {}
                None => return Err(StoreError::NotFound(id).into()),
            }
            tokio::select! {
                _ = events.recv() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Subscribes to lifecycle events of every instance.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Abandons pending retry delays and refuses new starts.
    ///
    /// Does not cancel instances: an instance whose retry delay is abandoned
    /// stays `running` in the store, and handlers already in flight finish.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(
            "Stopping workflow service with {} instance(s) in flight",
            self.running.len()
        );
        self.shutdown.cancel();
    }
}

/// Marks an instance failed outside the engine's own terminal write.
async fn record_failure(
    store: &dyn InstanceStore,
    events: &broadcast::Sender<WorkflowEvent>,
    id: Uuid,
    message: String,
) {
    let update = InstanceUpdate::new()
        .status(InstanceStatus::Failed)
        .error(message.clone());
    match store.update(id, update).await {
        Ok(_) => {
            let _ = events.send(WorkflowEvent::InstanceFailed {
                instance_id: id,
                error: message,
            });
        }
        Err(StoreError::InvalidTransition { from, .. }) => {
            debug!("Instance {} already {}; failure not recorded", id, from);
        }
        Err(e) => warn!("Could not record failure of {}: {}", id, e),
    }
}

/// Builder for [`WorkflowService`].
#[derive(Default)]
pub struct WorkflowServiceBuilder {
    store: Option<Arc<dyn InstanceStore>>,
    dispatcher: Option<Arc<dyn IsolatedDispatcher>>,
    config: ServiceConfig,
}

impl WorkflowServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists instances in `store` instead of process memory.
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enables isolated workflows.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn IsolatedDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<WorkflowService, WorkflowError> {
        self.config.validate()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn InstanceStore>);
        Ok(WorkflowService::assemble(store, self.dispatcher, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskStep;
    use ayatori_core::StepContext;
    use serde_json::json;

    async fn echo(input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
        Ok(input)
    }

    fn echo_workflow(name: &str) -> Workflow {
        Workflow::builder(name)
            .task("echo", TaskStep::from_fn(echo))
            .build()
            .expect("valid workflow")
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let service = WorkflowService::new();
        service.register(echo_workflow("dup")).expect("first registration");
        let error = service.register(echo_workflow("dup")).unwrap_err();
        assert!(matches!(error, WorkflowError::AlreadyRegistered(name) if name == "dup"));
        assert_eq!(service.workflow_names(), vec!["dup".to_string()]);
    }

    #[test]
    fn test_isolated_requires_dispatcher() {
        let service = WorkflowService::new();
        let workflow = Workflow::builder("iso")
            .task("echo", TaskStep::from_fn(echo))
            .isolated(true)
            .build()
            .expect("valid workflow");
        let error = service.register(workflow).unwrap_err();
        assert!(matches!(error, WorkflowError::Configuration(_)));
        assert!(!service.is_registered("iso"));
    }

    #[tokio::test]
    async fn test_start_unregistered_fails_without_instance() {
        let service = WorkflowService::new();
        let error = service.start("missing", Value::Null).await.unwrap_err();
        assert!(matches!(error, WorkflowError::NotRegistered(_)));
        assert!(service.get_all_instances().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_start_after_stop_is_rejected() {
        let service = WorkflowService::new();
        service.register(echo_workflow("echo")).expect("register");
        service.stop();
        let error = service.start("echo", Value::Null).await.unwrap_err();
        assert!(matches!(error, WorkflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_instance() {
        let service = WorkflowService::new();
        let error = service
            .wait_for(Uuid::now_v7(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, WorkflowError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_false() {
        let service = WorkflowService::new();
        assert!(!service.cancel(Uuid::now_v7()).await.expect("cancel"));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let result = WorkflowService::builder()
            .config(ServiceConfig {
                event_capacity: 0,
                ..ServiceConfig::default()
            })
            .build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_echo_roundtrip_through_service() {
        let service = WorkflowService::new();
        service.register(echo_workflow("echo")).expect("register");
        let id = service.start("echo", json!({"a": 1})).await.expect("start");
        let instance = service
            .wait_for(id, Duration::from_secs(5))
            .await
            .expect("completes");
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.output, Some(json!({"a": 1})));
    }
}
