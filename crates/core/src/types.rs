use crate::step::StepDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Runtime status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    /// Failed, but `continue_on.failure` lets dependents run
    FailedContinued,
    FailedBlocking,
    /// Skipped by a precondition, but `continue_on.skipped` lets dependents run
    SkippedContinued,
    SkippedBlocking,
    /// Never ran because an upstream step finished in a blocking state
    Blocked,
    Cancelled,
}

impl NodeStatus {
    /// A terminal status does not change again within the current cycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether dependents of a step in this status may run
    pub fn permits_dependents(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedContinued | Self::SkippedContinued
        )
    }

    /// Whether dependents of a step in this status must be blocked
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            Self::FailedBlocking | Self::SkippedBlocking | Self::Blocked
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedContinued | Self::FailedBlocking)
    }

    pub(crate) fn failed(continue_on_failure: bool) -> Self {
        if continue_on_failure {
            Self::FailedContinued
        } else {
            Self::FailedBlocking
        }
    }

    pub(crate) fn skipped(continue_on_skipped: bool) -> Self {
        if continue_on_skipped {
            Self::SkippedContinued
        } else {
            Self::SkippedBlocking
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedContinued => "failed (continued)",
            Self::FailedBlocking => "failed",
            Self::SkippedContinued => "skipped (continued)",
            Self::SkippedBlocking => "skipped",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// Fully loaded DAG definition handed to the executor
#[derive(Debug, Clone, Default)]
pub struct DagSpec {
    pub name: String,
    /// DAG-wide `KEY=VALUE` entries every step environment overlays
    pub env: Vec<String>,
    pub steps: Vec<Arc<StepDescriptor>>,
}

impl DagSpec {
    pub fn new(name: impl Into<String>, steps: Vec<StepDescriptor>) -> Self {
        Self {
            name: name.into(),
            env: Vec::new(),
            steps: steps.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }
}

/// Runtime record of a step, owned by the worker executing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: NodeStatus,
    /// Execution cycles started (one plus the number of repeats)
    pub iterations: u32,
    /// Attempts in the most recent cycle
    pub attempts: u32,
    /// Retries in the most recent cycle
    pub retries: u32,
    /// Command executions across all cycles
    pub executions: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether an error notification was requested
    pub notify: bool,
}

impl StepRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Pending,
            iterations: 0,
            attempts: 0,
            retries: 0,
            executions: 0,
            exit_code: None,
            error: None,
            started_at: None,
            finished_at: None,
            notify: false,
        }
    }
}

/// A specific execution of a DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub dag_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Step records in declaration order
    pub steps: Vec<StepRecord>,
}

impl Run {
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps whose terminal failure requested an error notification
    pub fn notifications(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.notify)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Derive the final run status from the step records
    pub(crate) fn final_status(steps: &[StepRecord], cancelled: bool) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if steps.iter().any(|s| s.status.is_failure()) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}
