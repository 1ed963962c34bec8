use crate::error::StepError;
use crate::types::NodeStatus;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Whether dependents may still run after this step fails or is skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinueOn {
    pub failure: bool,
    pub skipped: bool,
}

/// Retry policy for a step
///
/// `Limit { limit: 0, .. }` never retries, same as `NoRetry`, but still
/// shows up as a policy in diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    NoRetry,
    Limit {
        /// Maximum number of re-executions after the initial failing attempt
        limit: u32,
        /// Wait before each re-execution
        interval: Duration,
    },
}

impl RetryPolicy {
    pub fn limit(limit: u32) -> Self {
        Self::Limit {
            limit,
            interval: Duration::ZERO,
        }
    }

    /// Number of retries allowed per execution cycle
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NoRetry => 0,
            Self::Limit { limit, .. } => *limit,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Self::NoRetry => Duration::ZERO,
            Self::Limit { interval, .. } => *interval,
        }
    }

    /// Check whether another attempt is allowed after `retries` retries
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRetry => write!(f, "none"),
            Self::Limit { limit, interval } if interval.is_zero() => write!(f, "limit={}", limit),
            Self::Limit { limit, interval } => {
                write!(f, "limit={} interval={:?}", limit, interval)
            }
        }
    }
}

/// Gate checked before each execution cycle
///
/// `condition` is expanded against the step environment and compared to
/// `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

impl Condition {
    pub fn new(condition: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            expected: expected.into(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} == {}", self.condition, self.expected)
    }
}

/// Immutable definition of a single workflow step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepDescriptor {
    pub name: String,
    pub description: String,
    /// `KEY=VALUE` entries overlaying the parent environment
    pub variables: Vec<String>,
    /// Working directory, empty to inherit the engine default
    pub dir: String,
    pub command: String,
    pub args: Vec<String>,
    pub depends: Vec<String>,
    pub continue_on: ContinueOn,
    pub retry_policy: RetryPolicy,
    pub mail_on_error: bool,
    pub repeat: bool,
    pub repeat_interval: Duration,
    pub preconditions: Vec<Condition>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = depends.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = variables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_continue_on(mut self, failure: bool, skipped: bool) -> Self {
        self.continue_on = ContinueOn { failure, skipped };
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_mail_on_error(mut self, mail_on_error: bool) -> Self {
        self.mail_on_error = mail_on_error;
        self
    }

    pub fn with_repeat(mut self, interval: Duration) -> Self {
        self.repeat = true;
        self.repeat_interval = interval;
        self
    }

    pub fn with_preconditions(mut self, preconditions: Vec<Condition>) -> Self {
        self.preconditions = preconditions;
        self
    }

    /// Check the structural invariants of the step
    pub fn validate(&self) -> Result<(), StepError> {
        if self.name.is_empty() {
            return Err(StepError::invalid(&self.name, "name must not be empty"));
        }
        if self.command.is_empty() {
            return Err(StepError::invalid(&self.name, "command must not be empty"));
        }
        if self.repeat && self.repeat_interval.is_zero() {
            return Err(StepError::invalid(
                &self.name,
                "repeat interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Single-line diagnostic rendering, never parsed back
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Build the step environment: `parent` entries first, then the step's
    /// own variables. Later keys override earlier ones.
    pub fn environment(&self, parent: &[String]) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for entry in parent.iter().chain(self.variables.iter()) {
            let (key, value) = split_variable(entry);
            env.insert(key.to_string(), value.to_string());
        }
        env
    }

    /// Whether a step finalized with `status` should trigger an error notification
    pub fn should_notify(&self, status: NodeStatus) -> bool {
        self.mail_on_error && status.is_failure()
    }
}

impl fmt::Display for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Name: {}\tDir: {}\tCommand: {}\tArgs: [{}]\tDepends: [{}]",
            self.name,
            self.dir,
            self.command,
            self.args.join(" "),
            self.depends.join(", ")
        )
    }
}

fn split_variable(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}
