use super::command::CommandRunner;
use super::dag::StepGraph;
use super::emit;
use super::gate::{self, Dependency, GateDecision};
use super::precondition::ConditionEvaluator;
use super::step_executor::StepExecutor;
use crate::config::EngineConfig;
use crate::error::DagError;
use crate::events::{EventLog, EventType};
use crate::types::{DagSpec, NodeStatus, Run, RunId, RunStatus, StepRecord};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Executes DAGs of steps, one worker task per step
pub struct DagExecutor {
    config: EngineConfig,
    event_log: Arc<dyn EventLog>,
    step_executor: Arc<StepExecutor>,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<RunId, CancellationToken>>>,
}

impl DagExecutor {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
        evaluator: Arc<dyn ConditionEvaluator>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let step_executor = Arc::new(StepExecutor::new(
            runner,
            evaluator,
            event_log.clone(),
            config.clone(),
        ));

        Self {
            config,
            event_log,
            step_executor,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    /// Execute a DAG under a fresh run id that `cancel` can address
    pub async fn execute(&self, dag: &DagSpec) -> Result<Run, DagError> {
        let graph = StepGraph::build(dag)?;
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        self.active_runs.write().await.insert(run_id, cancel.clone());

        let result = self.run_graph(run_id, dag, &graph, cancel).await;

        self.active_runs.write().await.remove(&run_id);
        result
    }

    /// Execute a DAG, cancelled through the caller's token
    pub async fn execute_with_cancel(
        &self,
        dag: &DagSpec,
        cancel: CancellationToken,
    ) -> Result<Run, DagError> {
        let graph = StepGraph::build(dag)?;
        self.run_graph(RunId::new(), dag, &graph, cancel).await
    }

    /// Cancel a running DAG
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let active_runs = self.active_runs.read().await;

        if let Some(cancel) = active_runs.get(&run_id) {
            cancel.cancel();
            tracing::info!("Cancellation signal sent for run {}", run_id);
            Ok(())
        } else {
            Err(anyhow::anyhow!("Run {} is not active", run_id))
        }
    }

    /// Ids of the runs started through `execute` that are still running
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.active_runs.read().await.keys().copied().collect()
    }

    async fn run_graph(
        &self,
        run_id: RunId,
        dag: &DagSpec,
        graph: &StepGraph,
        cancel: CancellationToken,
    ) -> Result<Run, DagError> {
        let started_at = chrono::Utc::now();
        let clock = Instant::now();

        tracing::info!(
            "Starting DAG {}: run_id={}, steps={}",
            dag.name,
            run_id,
            graph.len()
        );
        emit(
            self.event_log.as_ref(),
            run_id,
            EventType::RunStarted {
                dag_name: dag.name.clone(),
                steps: graph.len(),
            },
        )
        .await;

        let parent_env: Arc<Vec<String>> = Arc::new(
            self.config
                .env
                .iter()
                .chain(dag.env.iter())
                .cloned()
                .collect(),
        );

        // Status arena: one channel per node, written only by that node's worker
        let (senders, receivers): (Vec<_>, Vec<_>) = graph
            .node_indices()
            .map(|_| watch::channel(NodeStatus::Pending))
            .unzip();

        let mut workers = Vec::with_capacity(graph.len());
        for (node, status_tx) in graph.node_indices().zip(senders) {
            let step = graph.step(node).clone();
            let mut deps: Vec<Dependency> = graph
                .dependency_nodes(node)
                .into_iter()
                .map(|dep| Dependency {
                    name: graph.step(dep).name.clone(),
                    status: receivers[dep.index()].clone(),
                })
                .collect();
            let step_executor = self.step_executor.clone();
            let parent_env = parent_env.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                match gate::wait_for_dependencies(&mut deps, &cancel).await {
                    GateDecision::Proceed => {
                        step_executor
                            .run(run_id, &step, &parent_env, &status_tx, &cancel)
                            .await
                    }
                    GateDecision::Blocked { upstream } => {
                        step_executor
                            .block(run_id, &step, upstream, &status_tx)
                            .await
                    }
                    // Wait is never returned once every dependency is terminal
                    GateDecision::Cancelled | GateDecision::Wait => {
                        step_executor
                            .cancel_pending(run_id, &step, &status_tx)
                            .await
                    }
                }
            });
            workers.push((graph.step(node).name.clone(), handle));
        }

        let mut steps: Vec<StepRecord> = Vec::with_capacity(workers.len());
        for (name, handle) in workers {
            match handle.await {
                Ok(record) => steps.push(record),
                Err(e) => {
                    tracing::error!("Step worker for {} did not finish: {}", name, e);
                    // Stop the remaining workers instead of leaving them detached
                    cancel.cancel();
                    return Err(DagError::Worker {
                        step: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        let status = Run::final_status(&steps, cancelled);
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        if cancelled {
            tracing::warn!("DAG {} cancelled: run_id={}", dag.name, run_id);
            emit(
                self.event_log.as_ref(),
                run_id,
                EventType::RunCancelled {
                    reason: "Cancellation requested".to_string(),
                },
            )
            .await;
        }

        match status {
            RunStatus::Failed => {
                tracing::error!("DAG {} failed: run_id={}", dag.name, run_id)
            }
            _ => tracing::info!(
                "DAG {} finished: run_id={}, status={:?}",
                dag.name,
                run_id,
                status
            ),
        }
        emit(
            self.event_log.as_ref(),
            run_id,
            EventType::RunFinished {
                status,
                duration_ms,
            },
        )
        .await;

        Ok(Run {
            id: run_id,
            dag_name: dag.name.clone(),
            status,
            started_at,
            completed_at: Some(chrono::Utc::now()),
            steps,
        })
    }
}
