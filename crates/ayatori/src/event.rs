//! Lifecycle events broadcast by the service.

use ayatori_core::StepName;
use serde::Serialize;
use uuid::Uuid;

/// A transition observed while running an instance.
///
/// Step events are also emitted for steps inside parallel branches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    InstanceStarted {
        instance_id: Uuid,
        workflow: String,
    },
    StepStarted {
        instance_id: Uuid,
        step: StepName,
    },
    StepCompleted {
        instance_id: Uuid,
        step: StepName,
    },
    StepRetrying {
        instance_id: Uuid,
        step: StepName,
        /// The attempt that just failed.
        attempt: u32,
        delay_ms: u64,
    },
    StepFailed {
        instance_id: Uuid,
        step: StepName,
        error: String,
    },
    InstanceCompleted {
        instance_id: Uuid,
    },
    InstanceFailed {
        instance_id: Uuid,
        error: String,
    },
    InstanceCancelled {
        instance_id: Uuid,
    },
}

impl WorkflowEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkflowEvent::InstanceStarted { instance_id, .. }
            | WorkflowEvent::StepStarted { instance_id, .. }
            | WorkflowEvent::StepCompleted { instance_id, .. }
            | WorkflowEvent::StepRetrying { instance_id, .. }
            | WorkflowEvent::StepFailed { instance_id, .. }
            | WorkflowEvent::InstanceCompleted { instance_id }
            | WorkflowEvent::InstanceFailed { instance_id, .. }
            | WorkflowEvent::InstanceCancelled { instance_id } => *instance_id,
        }
    }

    /// Returns `true` for events that end an instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::InstanceCompleted { .. }
                | WorkflowEvent::InstanceFailed { .. }
                | WorkflowEvent::InstanceCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_tag() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::StepRetrying {
            instance_id: id,
            step: StepName::new("charge"),
            attempt: 2,
            delay_ms: 200,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], json!("step_retrying"));
        assert_eq!(value["step"], json!("charge"));
        assert_eq!(event.instance_id(), id);
        assert!(!event.is_terminal());
        assert!(WorkflowEvent::InstanceCancelled { instance_id: id }.is_terminal());
    }
}
