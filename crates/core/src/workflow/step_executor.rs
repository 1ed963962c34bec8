use super::command::{CommandRequest, CommandRunner};
use super::precondition::{check_preconditions, ConditionEvaluator, PreconditionOutcome};
use super::emit;
use crate::config::EngineConfig;
use crate::error::StepError;
use crate::events::{EventLog, EventType};
use crate::step::StepDescriptor;
use crate::types::{NodeStatus, RunId, StepRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How one execution cycle (initial attempt plus retries) ended
#[derive(Debug)]
enum CycleOutcome {
    Succeeded,
    Failed(StepError),
    Cancelled,
}

/// Runs a single step: precondition gate, retry controller and repeat loop
pub struct StepExecutor {
    runner: Arc<dyn CommandRunner>,
    evaluator: Arc<dyn ConditionEvaluator>,
    event_log: Arc<dyn EventLog>,
    config: EngineConfig,
    // Bounds concurrently running commands when max_active_steps > 0
    limiter: Option<Arc<Semaphore>>,
}

impl StepExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        evaluator: Arc<dyn ConditionEvaluator>,
        event_log: Arc<dyn EventLog>,
        config: EngineConfig,
    ) -> Self {
        let limiter = (config.max_active_steps > 0)
            .then(|| Arc::new(Semaphore::new(config.max_active_steps)));

        Self {
            runner,
            evaluator,
            event_log,
            config,
            limiter,
        }
    }

    /// Run a step whose dependencies allowed it to start
    ///
    /// Publishes every status change on `status` and returns the final
    /// record. The published status only becomes terminal once the step
    /// stops repeating.
    pub async fn run(
        &self,
        run_id: RunId,
        step: &StepDescriptor,
        parent_env: &[String],
        status: &watch::Sender<NodeStatus>,
        cancel: &CancellationToken,
    ) -> StepRecord {
        let mut record = StepRecord::new(&step.name);
        record.started_at = Some(Utc::now());
        let env = step.environment(parent_env);

        let final_status = loop {
            record.iterations += 1;
            record.error = None;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break self.cancelled(&mut record),
                outcome = check_preconditions(self.evaluator.as_ref(), &step.preconditions, &env) => outcome,
            };

            if let PreconditionOutcome::Unmet {
                condition, reason, ..
            } = outcome
            {
                tracing::info!("Skipping step {}: {}", step.name, reason);
                emit(
                    self.event_log.as_ref(),
                    run_id,
                    EventType::StepSkipped {
                        step: step.name.clone(),
                        condition: condition.to_string(),
                    },
                )
                .await;
                record.error = Some(reason);
                break NodeStatus::skipped(step.continue_on.skipped);
            }

            let cycle_status = match self
                .run_cycle(run_id, step, &env, &mut record, status, cancel)
                .await
            {
                CycleOutcome::Succeeded => NodeStatus::Succeeded,
                CycleOutcome::Failed(err) => {
                    record.error = Some(err.to_string());
                    NodeStatus::failed(step.continue_on.failure)
                }
                CycleOutcome::Cancelled => break self.cancelled(&mut record),
            };

            if !step.repeat || cycle_status == NodeStatus::FailedBlocking {
                break cycle_status;
            }

            tracing::info!(
                "Step {} finished iteration {} ({}), repeating in {:?}",
                step.name,
                record.iterations,
                cycle_status,
                step.repeat_interval
            );
            status.send_replace(NodeStatus::Pending);
            emit(
                self.event_log.as_ref(),
                run_id,
                EventType::StepRepeatScheduled {
                    step: step.name.clone(),
                    iteration: record.iterations + 1,
                    interval_ms: duration_ms(step.repeat_interval),
                },
            )
            .await;

            if !wait_or_cancel(step.repeat_interval, cancel).await {
                break self.cancelled(&mut record);
            }
        };

        self.finalize(run_id, step, record, final_status, status)
            .await
    }

    /// Finish a step that never ran because an upstream step blocks it
    pub async fn block(
        &self,
        run_id: RunId,
        step: &StepDescriptor,
        upstream: String,
        status: &watch::Sender<NodeStatus>,
    ) -> StepRecord {
        tracing::info!("Step {} blocked by upstream step {}", step.name, upstream);

        let mut record = StepRecord::new(&step.name);
        record.error = Some(
            StepError::Blocked {
                step: step.name.clone(),
                upstream: upstream.clone(),
            }
            .to_string(),
        );
        emit(
            self.event_log.as_ref(),
            run_id,
            EventType::StepBlocked {
                step: step.name.clone(),
                upstream,
            },
        )
        .await;

        self.finalize(run_id, step, record, NodeStatus::Blocked, status)
            .await
    }

    /// Finish a step that was cancelled before it could start
    pub async fn cancel_pending(
        &self,
        run_id: RunId,
        step: &StepDescriptor,
        status: &watch::Sender<NodeStatus>,
    ) -> StepRecord {
        let mut record = StepRecord::new(&step.name);
        let final_status = self.cancelled(&mut record);
        self.finalize(run_id, step, record, final_status, status)
            .await
    }

    /// One execution cycle: the initial attempt plus retries
    async fn run_cycle(
        &self,
        run_id: RunId,
        step: &StepDescriptor,
        env: &HashMap<String, String>,
        record: &mut StepRecord,
        status: &watch::Sender<NodeStatus>,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        record.attempts = 0;
        record.retries = 0;

        loop {
            record.attempts += 1;
            let attempt = record.attempts;
            let start = Instant::now();

            match self.run_attempt(run_id, step, env, record, status, cancel).await {
                Ok(()) => {
                    tracing::info!("Step {} succeeded (attempt {})", step.name, attempt);
                    emit(
                        self.event_log.as_ref(),
                        run_id,
                        EventType::StepSucceeded {
                            step: step.name.clone(),
                            attempt,
                            duration_ms: duration_ms(start.elapsed()),
                        },
                    )
                    .await;
                    return CycleOutcome::Succeeded;
                }
                Err(StepError::Cancelled { .. }) => return CycleOutcome::Cancelled,
                Err(err) => {
                    let will_retry =
                        err.is_retryable() && step.retry_policy.allows_retry(record.retries);
                    tracing::warn!(
                        "Step {} failed (attempt {}, retry policy {}): {}",
                        step.name,
                        attempt,
                        step.retry_policy,
                        err
                    );
                    emit(
                        self.event_log.as_ref(),
                        run_id,
                        EventType::StepFailed {
                            step: step.name.clone(),
                            error: err.to_string(),
                            attempt,
                            retry_policy: step.retry_policy.to_string(),
                            will_retry,
                        },
                    )
                    .await;

                    if !will_retry {
                        return CycleOutcome::Failed(err);
                    }

                    record.retries += 1;
                    let interval = step.retry_policy.interval();
                    tracing::info!(
                        "Retrying step {} after {:?} (retry {} of {})",
                        step.name,
                        interval,
                        record.retries,
                        step.retry_policy.max_retries()
                    );
                    status.send_replace(NodeStatus::Pending);

                    if !wait_or_cancel(interval, cancel).await {
                        return CycleOutcome::Cancelled;
                    }
                }
            }
        }
    }

    /// Run the command once
    async fn run_attempt(
        &self,
        run_id: RunId,
        step: &StepDescriptor,
        env: &HashMap<String, String>,
        record: &mut StepRecord,
        status: &watch::Sender<NodeStatus>,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let cancelled = || StepError::Cancelled {
            step: step.name.clone(),
        };

        let _permit = match &self.limiter {
            Some(limiter) => tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                permit = limiter.acquire() => Some(permit.map_err(|e| StepError::ExecutionFailure {
                    step: step.name.clone(),
                    reason: e.to_string(),
                })?),
            },
            None => None,
        };

        status.send_replace(NodeStatus::Running);
        record.executions += 1;
        tracing::info!(
            "Executing step {} (iteration {}, attempt {}) for run {}",
            step.name,
            record.iterations,
            record.attempts,
            run_id
        );
        emit(
            self.event_log.as_ref(),
            run_id,
            EventType::StepStarted {
                step: step.name.clone(),
                iteration: record.iterations,
                attempt: record.attempts,
            },
        )
        .await;

        let request = CommandRequest {
            step: step.name.clone(),
            command: step.command.clone(),
            args: step.args.clone(),
            dir: self.config.resolve_dir(&step.dir),
            env: env.clone(),
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = self.runner.run(request) => result,
        };

        match result {
            Ok(code) => {
                record.exit_code = Some(code);
                if code == 0 {
                    Ok(())
                } else {
                    Err(StepError::ExecutionFailure {
                        step: step.name.clone(),
                        reason: format!("exit code {}", code),
                    })
                }
            }
            Err(e) => Err(StepError::ExecutionFailure {
                step: step.name.clone(),
                reason: format!("{:#}", e),
            }),
        }
    }

    fn cancelled(&self, record: &mut StepRecord) -> NodeStatus {
        record.error = Some(
            StepError::Cancelled {
                step: record.name.clone(),
            }
            .to_string(),
        );
        NodeStatus::Cancelled
    }

    async fn finalize(
        &self,
        run_id: RunId,
        step: &StepDescriptor,
        mut record: StepRecord,
        final_status: NodeStatus,
        status: &watch::Sender<NodeStatus>,
    ) -> StepRecord {
        record.status = final_status;
        record.finished_at = Some(Utc::now());
        record.notify = step.should_notify(final_status);

        if final_status == NodeStatus::Cancelled {
            tracing::warn!("Step {} cancelled", step.name);
            emit(
                self.event_log.as_ref(),
                run_id,
                EventType::StepCancelled {
                    step: step.name.clone(),
                },
            )
            .await;
        }

        if record.notify {
            tracing::warn!("Step {} {}: error notification requested", step.name, final_status);
            emit(
                self.event_log.as_ref(),
                run_id,
                EventType::NotificationRequested {
                    step: step.name.clone(),
                    status: final_status,
                },
            )
            .await;
        }

        emit(
            self.event_log.as_ref(),
            run_id,
            EventType::StepFinished {
                step: step.name.clone(),
                status: final_status,
            },
        )
        .await;

        // Dependents observe the terminal status from here on
        status.send_replace(final_status);
        record
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
async fn wait_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::step::{Condition, RetryPolicy};
    use crate::workflow::precondition::EnvConditionEvaluator;
    use crate::workflow::testing::{Behavior, ScriptedRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every evaluation with the next scripted result, then `false`
    struct ScriptedEvaluator {
        results: Vec<bool>,
        evaluations: AtomicUsize,
    }

    impl ScriptedEvaluator {
        fn new(results: Vec<bool>) -> Self {
            Self {
                results,
                evaluations: AtomicUsize::new(0),
            }
        }

        fn evaluations(&self) -> usize {
            self.evaluations.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ConditionEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            _condition: &Condition,
            _env: &HashMap<String, String>,
        ) -> anyhow::Result<bool> {
            let n = self.evaluations.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.get(n).copied().unwrap_or(false))
        }
    }

    fn executor(runner: Arc<ScriptedRunner>) -> StepExecutor {
        StepExecutor::new(
            runner,
            Arc::new(EnvConditionEvaluator),
            Arc::new(MemoryEventLog::new()),
            EngineConfig::default(),
        )
    }

    async fn run_step(executor: &StepExecutor, step: &StepDescriptor) -> StepRecord {
        let (tx, _rx) = watch::channel(NodeStatus::Pending);
        executor
            .run(RunId::new(), step, &[], &tx, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_success_single_attempt() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("ok", "true");

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::Succeeded);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.error.is_none());
        assert_eq!(runner.calls("ok"), 1);
    }

    #[tokio::test]
    async fn test_retry_limit_bounds_attempts() {
        let runner = Arc::new(ScriptedRunner::new().with("flaky", Behavior::Fail(1)));
        let executor = executor(runner.clone());

        let step = StepDescriptor::new("flaky", "false").with_retry_policy(RetryPolicy::limit(2));
        let record = run_step(&executor, &step).await;

        assert_eq!(runner.calls("flaky"), 3);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.retries, 2);
        assert_eq!(record.status, NodeStatus::FailedBlocking);
        assert_eq!(record.exit_code, Some(1));
        assert!(record.error.unwrap().contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_retry_limit_zero_and_no_retry_behave_alike() {
        for policy in [RetryPolicy::NoRetry, RetryPolicy::limit(0)] {
            let runner = Arc::new(ScriptedRunner::new().with("once", Behavior::Fail(2)));
            let executor = executor(runner.clone());
            let step = StepDescriptor::new("once", "false")
                .with_retry_policy(policy)
                .with_continue_on(true, false);

            let record = run_step(&executor, &step).await;

            assert_eq!(runner.calls("once"), 1);
            assert_eq!(record.status, NodeStatus::FailedContinued);
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let runner = Arc::new(
            ScriptedRunner::new().with("eventually", Behavior::Sequence(vec![1, 1, 0])),
        );
        let executor = executor(runner.clone());
        let step =
            StepDescriptor::new("eventually", "check").with_retry_policy(RetryPolicy::limit(5));

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::Succeeded);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.retries, 2);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_start_failure_is_execution_failure() {
        let runner = Arc::new(ScriptedRunner::new().with("missing", Behavior::StartError));
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("missing", "nope");

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::FailedBlocking);
        assert_eq!(record.exit_code, None);
        assert!(record.error.unwrap().contains("could not start"));
    }

    #[tokio::test]
    async fn test_precondition_skip_bypasses_retry() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("gated", "true")
            .with_retry_policy(RetryPolicy::limit(3))
            .with_preconditions(vec![Condition::new("a", "b")]);

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::SkippedBlocking);
        assert_eq!(record.attempts, 0);
        assert_eq!(runner.calls("gated"), 0);
    }

    #[tokio::test]
    async fn test_preconditions_see_step_variables() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("gated", "true")
            .with_variables(["TARGET=prod"])
            .with_preconditions(vec![Condition::new("$TARGET", "prod")]);

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::Succeeded);
        assert_eq!(runner.calls("gated"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_interval_is_honored() {
        let runner = Arc::new(ScriptedRunner::new().with("slow", Behavior::Fail(1)));
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("slow", "false").with_retry_policy(RetryPolicy::Limit {
            limit: 2,
            interval: Duration::from_secs(30),
        });

        let start = Instant::now();
        let record = run_step(&executor, &step).await;

        assert_eq!(record.attempts, 3);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_wait() {
        let runner = Arc::new(ScriptedRunner::new().with("wait", Behavior::Fail(1)));
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("wait", "false").with_retry_policy(RetryPolicy::Limit {
            limit: 5,
            interval: Duration::from_secs(60),
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let (tx, rx) = watch::channel(NodeStatus::Pending);
        let record = executor.run(RunId::new(), &step, &[], &tx, &cancel).await;

        assert_eq!(record.status, NodeStatus::Cancelled);
        assert_eq!(*rx.borrow(), NodeStatus::Cancelled);
        assert_eq!(runner.calls("wait"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_command() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .with("long", Behavior::Succeed)
                .with_delay(Duration::from_secs(3600)),
        );
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("long", "sleep");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let (tx, _rx) = watch::channel(NodeStatus::Pending);
        let record = executor.run(RunId::new(), &step, &[], &tx, &cancel).await;

        assert_eq!(record.status, NodeStatus::Cancelled);
        assert_eq!(record.exit_code, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_until_cancelled() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("poll", "true").with_repeat(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let (tx, _rx) = watch::channel(NodeStatus::Pending);
        let record = executor.run(RunId::new(), &step, &[], &tx, &cancel).await;

        // Runs at t=0, 5 and 10, cancelled while waiting for t=15
        assert_eq!(runner.calls("poll"), 3);
        assert_eq!(record.iterations, 3);
        assert_eq!(record.status, NodeStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_stops_on_skip() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("poll", "true")
            .with_repeat(Duration::from_secs(5))
            .with_preconditions(vec![Condition::new("$DAGRUN_TEST_NEVER_SET", "yes")])
            .with_continue_on(false, true);

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::SkippedContinued);
        assert_eq!(runner.calls("poll"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions_rechecked_before_each_repeat() {
        let runner = Arc::new(ScriptedRunner::new());
        let evaluator = Arc::new(ScriptedEvaluator::new(vec![true, true, false]));
        let executor = StepExecutor::new(
            runner.clone(),
            evaluator.clone(),
            Arc::new(MemoryEventLog::new()),
            EngineConfig::default(),
        );
        let step = StepDescriptor::new("poll", "true")
            .with_repeat(Duration::from_secs(5))
            .with_preconditions(vec![Condition::new("$READY", "yes")]);

        let record = run_step(&executor, &step).await;

        assert_eq!(evaluator.evaluations(), 3);
        assert_eq!(runner.calls("poll"), 2);
        assert_eq!(record.iterations, 3);
        assert_eq!(record.status, NodeStatus::SkippedBlocking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_stops_on_blocking_failure() {
        let runner = Arc::new(ScriptedRunner::new().with("poll", Behavior::Sequence(vec![0, 0, 1])));
        let executor = executor(runner.clone());
        let step = StepDescriptor::new("poll", "check").with_repeat(Duration::from_secs(5));

        let record = run_step(&executor, &step).await;

        assert_eq!(record.status, NodeStatus::FailedBlocking);
        assert_eq!(record.iterations, 3);
        assert_eq!(runner.calls("poll"), 3);
    }

    #[tokio::test]
    async fn test_notification_flag() {
        let runner = Arc::new(ScriptedRunner::new().with("bad", Behavior::Fail(1)));
        let executor = executor(runner);
        let step = StepDescriptor::new("bad", "false").with_mail_on_error(true);

        let record = run_step(&executor, &step).await;

        assert!(record.notify);
    }
}
