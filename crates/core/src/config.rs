use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine-wide execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Working directory for steps that do not set one
    #[serde(default)]
    pub default_dir: Option<PathBuf>,

    /// Maximum number of commands running at once (0 = unlimited)
    #[serde(default = "default_max_active_steps")]
    pub max_active_steps: usize,

    /// `KEY=VALUE` entries applied beneath every DAG and step environment
    #[serde(default)]
    pub env: Vec<String>,
}

fn default_max_active_steps() -> usize {
    0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_dir: None,
            max_active_steps: default_max_active_steps(),
            env: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Resolve the working directory for a step's `dir` field
    pub fn resolve_dir(&self, step_dir: &str) -> Option<PathBuf> {
        if !step_dir.is_empty() {
            return Some(PathBuf::from(step_dir));
        }
        self.default_dir.clone()
    }
}
