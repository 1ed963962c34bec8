//! Error types for step validation, execution and DAG construction.

/// Errors raised for a single step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Structural problem found at validation time. Fatal to DAG load.
    #[error("invalid step `{name}`: {reason}")]
    InvalidStep { name: String, reason: String },

    /// A single attempt exited non-zero or could not start.
    #[error("step `{step}` failed: {reason}")]
    ExecutionFailure { step: String, reason: String },

    /// An upstream dependency finished in a blocking state.
    #[error("step `{step}` blocked by upstream step `{upstream}`")]
    Blocked { step: String, upstream: String },

    /// The enclosing run was cancelled.
    #[error("step `{step}` cancelled")]
    Cancelled { step: String },
}

impl StepError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidStep {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if the error can be recovered from by retrying the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailure { .. })
    }
}

/// Errors raised while building the step graph of a DAG.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error(transparent)]
    InvalidStep(#[from] StepError),

    #[error("duplicate step name `{0}`")]
    DuplicateStep(String),

    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },

    #[error("DAG contains circular dependencies")]
    Cycle,

    #[error("step worker for `{step}` did not finish: {reason}")]
    Worker { step: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_execution_failures_are_retryable() {
        let failure = StepError::ExecutionFailure {
            step: "build".to_string(),
            reason: "exit code 2".to_string(),
        };
        assert!(failure.is_retryable());
        assert!(!StepError::Cancelled {
            step: "build".to_string()
        }
        .is_retryable());
        assert!(!StepError::invalid("build", "empty command").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = StepError::Blocked {
            step: "deploy".to_string(),
            upstream: "build".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "step `deploy` blocked by upstream step `build`"
        );

        let err: DagError = StepError::invalid("", "name must not be empty").into();
        assert_eq!(err.to_string(), "invalid step ``: name must not be empty");
    }
}
