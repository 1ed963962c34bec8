pub mod command;
pub mod dag;
pub mod executor;
pub mod gate;
pub mod precondition;
pub mod step_executor;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{CommandRequest, CommandRunner, ProcessCommandRunner};
pub use dag::StepGraph;
pub use executor::DagExecutor;
pub use gate::GateDecision;
pub use precondition::{ConditionEvaluator, EnvConditionEvaluator, PreconditionOutcome};
pub use step_executor::StepExecutor;

use crate::events::{Event, EventLog, EventType};
use crate::types::RunId;

/// Append an event, logging instead of failing the step when the log is unavailable
pub(crate) async fn emit(event_log: &dyn EventLog, run_id: RunId, event_type: EventType) {
    if let Err(e) = event_log.append(Event::new(run_id, event_type)).await {
        tracing::warn!("Failed to append event for run {}: {:#}", run_id, e);
    }
}
