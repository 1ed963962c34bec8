use crate::types::{NodeStatus, RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// An event in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while executing a DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        dag_name: String,
        steps: usize,
    },
    RunFinished {
        status: RunStatus,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepStarted {
        step: String,
        iteration: u32,
        attempt: u32,
    },
    StepSucceeded {
        step: String,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        step: String,
        error: String,
        attempt: u32,
        /// Rendered policy, `none` when the step has no retry policy
        retry_policy: String,
        will_retry: bool,
    },
    StepSkipped {
        step: String,
        condition: String,
    },
    StepBlocked {
        step: String,
        upstream: String,
    },
    StepCancelled {
        step: String,
    },
    StepRepeatScheduled {
        step: String,
        iteration: u32,
        interval_ms: u64,
    },
    StepFinished {
        step: String,
        status: NodeStatus,
    },

    // Notification collaborator
    NotificationRequested {
        step: String,
        status: NodeStatus,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}

/// In-memory event log
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}
