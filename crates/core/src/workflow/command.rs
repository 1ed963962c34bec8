use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

/// Everything needed to run one attempt of a step's command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub step: String,
    pub command: String,
    pub args: Vec<String>,
    /// Working directory; `None` inherits the process working directory
    pub dir: Option<PathBuf>,
    /// Variables set on top of the inherited process environment
    pub env: HashMap<String, String>,
}

/// Runs a command and reports its exit code
///
/// `Err` means the command could not be started at all. Dropping the
/// returned future must stop the command.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: CommandRequest) -> anyhow::Result<i32>;
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessCommandRunner {
    /// Discard the child's stdout/stderr instead of inheriting them
    quiet: bool,
}

impl ProcessCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, request: CommandRequest) -> anyhow::Result<i32> {
        tracing::debug!(
            "Spawning {} {:?} for step {}",
            request.command,
            request.args,
            request.step
        );

        let mut command = tokio::process::Command::new(&request.command);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.quiet {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if let Some(dir) = &request.dir {
            command.current_dir(dir);
        }

        let status = command
            .status()
            .await
            .with_context(|| format!("Failed to start command {}", request.command))?;

        // Killed by a signal: no exit code
        Ok(status.code().unwrap_or(-1))
    }
}
