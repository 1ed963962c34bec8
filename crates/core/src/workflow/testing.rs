//! Scripted command runner for engine tests.

use super::command::{CommandRequest, CommandRunner};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Succeed,
    /// Always exit with this code
    Fail(i32),
    /// Exit codes for successive attempts; the last one repeats
    Sequence(Vec<i32>),
    StartError,
}

#[derive(Default)]
pub(crate) struct ScriptedRunner {
    behaviors: HashMap<String, Behavior>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    timeline: Mutex<Vec<String>>,
    requests: Mutex<HashMap<String, CommandRequest>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, step: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(step.to_string(), behavior);
        self
    }

    /// Every command takes this long to finish
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self, step: &str) -> usize {
        self.calls.lock().unwrap().get(step).copied().unwrap_or(0)
    }

    /// `start:<step>` / `end:<step>` entries in the order they happened
    pub(crate) fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }

    pub(crate) fn last_request(&self, step: &str) -> Option<CommandRequest> {
        self.requests.lock().unwrap().get(step).cloned()
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.timeline().iter().position(|e| e == entry)
    }

    /// Whether `first` finished before `second` started
    pub(crate) fn finished_before(&self, first: &str, second: &str) -> bool {
        match (
            self.position(&format!("end:{}", first)),
            self.position(&format!("start:{}", second)),
        ) {
            (Some(end), Some(start)) => end < start,
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, request: CommandRequest) -> anyhow::Result<i32> {
        let step = request.step.clone();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(step.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.requests
            .lock()
            .unwrap()
            .insert(step.clone(), request);
        self.timeline.lock().unwrap().push(format!("start:{}", step));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.timeline.lock().unwrap().push(format!("end:{}", step));

        match self.behaviors.get(&step).cloned().unwrap_or(Behavior::Succeed) {
            Behavior::Succeed => Ok(0),
            Behavior::Fail(code) => Ok(code),
            Behavior::Sequence(codes) => Ok(codes
                .get(call - 1)
                .or_else(|| codes.last())
                .copied()
                .unwrap_or(0)),
            Behavior::StartError => Err(anyhow::anyhow!("command could not start")),
        }
    }
}
