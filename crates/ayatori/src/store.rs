//! In-memory [`InstanceStore`].

use async_trait::async_trait;
use ayatori_core::{
    InstanceFilter, InstanceStore, InstanceUpdate, StoreError, WorkflowInstance,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Records {
    instances: HashMap<Uuid, WorkflowInstance>,
    order: Vec<Uuid>,
}

/// Reference store keeping every instance in process memory.
///
/// Lists return instances in insertion order. Nothing is ever evicted;
/// retention is up to the host.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn create(
        &self,
        workflow_name: &str,
        input: Value,
    ) -> Result<WorkflowInstance, StoreError> {
        let instance = WorkflowInstance::new(workflow_name, input);
        let mut records = self.records.write().await;
        records.order.push(instance.id);
        records.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.records.read().await.instances.get(&id).cloned())
    }

    async fn update(
        &self,
        id: Uuid,
        update: InstanceUpdate,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut records = self.records.write().await;
        let instance = records
            .instances
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;

        if let Some(next) = update.status {
            if !instance.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: instance.status,
                    to: next,
                });
            }
        } else if instance.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: instance.status,
                to: instance.status,
            });
        }

        instance.apply(update);
        Ok(instance.clone())
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>, StoreError> {
        let records = self.records.read().await;
        let matching = records
            .order
            .iter()
            .filter_map(|id| records.instances.get(id))
            .filter(|instance| filter.matches(instance))
            .cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ayatori_core::InstanceStatus;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let created = assert_ok!(store.create("orders", json!({"id": 1})).await);
        assert_eq!(created.status, InstanceStatus::Pending);

        let loaded = assert_ok!(store.get(created.id).await).expect("instance exists");
        assert_eq!(loaded, created);
        assert_eq!(assert_ok!(store.get(Uuid::now_v7()).await), None);
    }

    #[tokio::test]
    async fn test_update_enforces_monotonic_status() {
        let store = MemoryStore::new();
        let id = assert_ok!(store.create("orders", Value::Null).await).id;

        assert_ok!(
            store
                .update(id, InstanceUpdate::new().status(InstanceStatus::Running))
                .await
        );
        let done = assert_ok!(
            store
                .update(
                    id,
                    InstanceUpdate::new()
                        .status(InstanceStatus::Completed)
                        .output(json!(1))
                )
                .await
        );
        assert_eq!(done.output, Some(json!(1)));

        let error = assert_err!(
            store
                .update(id, InstanceUpdate::new().status(InstanceStatus::Cancelled))
                .await
        );
        assert!(matches!(
            error,
            StoreError::InvalidTransition {
                from: InstanceStatus::Completed,
                to: InstanceStatus::Cancelled,
                ..
            }
        ));

        let error = assert_err!(store.update(id, InstanceUpdate::new().output(json!(2))).await);
        assert!(matches!(error, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_unknown_instance() {
        let store = MemoryStore::new();
        let error = assert_err!(store.update(Uuid::now_v7(), InstanceUpdate::new()).await);
        assert!(matches!(error, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filters_in_insertion_order() {
        let store = MemoryStore::new();
        let a = assert_ok!(store.create("a", Value::Null).await).id;
        let b = assert_ok!(store.create("b", Value::Null).await).id;
        let a2 = assert_ok!(store.create("a", Value::Null).await).id;
        assert_ok!(
            store
                .update(a2, InstanceUpdate::new().status(InstanceStatus::Running))
                .await
        );

        let all = assert_ok!(store.list(&InstanceFilter::new()).await);
        assert_eq!(all.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b, a2]);

        let only_a = assert_ok!(store.list(&InstanceFilter::new().workflow("a")).await);
        assert_eq!(only_a.len(), 2);

        let running = assert_ok!(
            store
                .list(&InstanceFilter::new().status(InstanceStatus::Running))
                .await
        );
        assert_eq!(running.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a2]);

        let limited = assert_ok!(store.list(&InstanceFilter::new().limit(1)).await);
        assert_eq!(limited.len(), 1);
        assert_eq!(store.len().await, 3);
    }
}
