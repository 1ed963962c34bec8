use anyhow::{Context, Result};
use dagrun_core::{Condition, ContinueOn, DagSpec, RetryPolicy, StepDescriptor};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// DAG definition file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DagFile {
    /// Defaults to the file stem
    pub name: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub continue_on: ContinueOnConfig,
    pub retry_policy: Option<RetryPolicyConfig>,
    #[serde(default)]
    pub mail_on_error: bool,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub repeat_interval_secs: u64,
    #[serde(default)]
    pub preconditions: Vec<ConditionConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinueOnConfig {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicyConfig {
    pub limit: u32,
    #[serde(default)]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub condition: String,
    pub expected: String,
}

impl TryFrom<StepConfig> for StepDescriptor {
    type Error = anyhow::Error;

    fn try_from(config: StepConfig) -> Result<Self> {
        let (command, args) = split_command(&config.name, config.command, config.args)?;

        Ok(StepDescriptor {
            name: config.name,
            description: config.description,
            variables: config.variables,
            dir: config.dir,
            command,
            args,
            depends: config.depends,
            continue_on: ContinueOn {
                failure: config.continue_on.failure,
                skipped: config.continue_on.skipped,
            },
            retry_policy: config
                .retry_policy
                .map(|p| RetryPolicy::Limit {
                    limit: p.limit,
                    interval: Duration::from_secs(p.interval_secs),
                })
                .unwrap_or_default(),
            mail_on_error: config.mail_on_error,
            repeat: config.repeat,
            repeat_interval: Duration::from_secs(config.repeat_interval_secs),
            preconditions: config
                .preconditions
                .into_iter()
                .map(|c| Condition::new(c.condition, c.expected))
                .collect(),
        })
    }
}

/// `command = "echo hello"` without `args` splits on whitespace
///
/// Quotes are not interpreted, so a quoted command is rejected; list its
/// arguments in `args` instead.
fn split_command(
    step: &str,
    command: String,
    args: Vec<String>,
) -> Result<(String, Vec<String>)> {
    if !args.is_empty() {
        return Ok((command, args));
    }
    if command.contains(['"', '\'']) {
        anyhow::bail!(
            "Step {}: quoted command `{}` needs its arguments listed in `args`",
            step,
            command
        );
    }
    let mut parts = command.split_whitespace().map(str::to_string);
    Ok(match parts.next() {
        Some(program) => (program, parts.collect()),
        None => (command, args),
    })
}

impl DagFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse DAG file")
    }

    /// Read a DAG file into the engine's DAG definition
    pub fn load(path: &Path) -> Result<DagSpec> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read DAG file {}", path.display()))?;
        let file = Self::parse(&content)?;

        let default_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dag".to_string());

        file.into_spec(default_name)
            .with_context(|| format!("Invalid DAG file {}", path.display()))
    }

    pub fn into_spec(self, default_name: String) -> Result<DagSpec> {
        let steps = self
            .steps
            .into_iter()
            .map(|s| StepDescriptor::try_from(s).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(DagSpec {
            name: self.name.unwrap_or(default_name),
            env: self.env,
            steps,
        })
    }
}
