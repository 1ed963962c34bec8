// Step model and DAG execution engine for dagrun

pub mod config;
pub mod error;
pub mod events;
pub mod step;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{DagError, StepError};
pub use step::{Condition, ContinueOn, RetryPolicy, StepDescriptor};
pub use types::*;
