//! Dependency gate: decides whether a step may start from the terminal
//! states of its dependencies.

use crate::types::NodeStatus;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Outcome of the dependency gate for a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Some dependency has not reached a terminal state yet
    Wait,
    /// Every dependency finished in a state that permits dependents
    Proceed,
    /// A dependency finished in a blocking state
    Blocked { upstream: String },
    /// A dependency was cancelled, or the run was
    Cancelled,
}

/// Evaluate the gate over `(dependency name, status)` pairs
pub fn evaluate<'a, I>(deps: I) -> GateDecision
where
    I: IntoIterator<Item = (&'a str, NodeStatus)>,
{
    let mut decision = GateDecision::Proceed;
    for (name, status) in deps {
        if !status.is_terminal() {
            return GateDecision::Wait;
        }
        if decision != GateDecision::Proceed {
            continue;
        }
        if status.blocks_dependents() {
            decision = GateDecision::Blocked {
                upstream: name.to_string(),
            };
        } else if status == NodeStatus::Cancelled {
            decision = GateDecision::Cancelled;
        }
    }
    decision
}

/// A dependency as seen by a waiting step
pub struct Dependency {
    pub name: String,
    pub status: watch::Receiver<NodeStatus>,
}

/// Suspend until the gate can decide, then return the decision
///
/// Returns `Blocked` as soon as any dependency reaches a blocking status,
/// otherwise waits until every dependency is terminal. Never returns `Wait`.
/// Cancellation ends the wait with `Cancelled`.
pub async fn wait_for_dependencies(
    deps: &mut [Dependency],
    cancel: &CancellationToken,
) -> GateDecision {
    loop {
        let statuses: Vec<(String, NodeStatus)> = deps
            .iter()
            .map(|d| (d.name.clone(), *d.status.borrow()))
            .collect();

        // Blocking statuses are final
        let decision = match statuses.iter().find(|(_, s)| s.blocks_dependents()) {
            Some((name, _)) => GateDecision::Blocked {
                upstream: name.clone(),
            },
            None => evaluate(statuses.iter().map(|(n, s)| (n.as_str(), *s))),
        };
        if decision != GateDecision::Wait {
            tracing::debug!("Dependency gate decision: {:?}", decision);
            return decision;
        }

        let pending = deps
            .iter_mut()
            .zip(&statuses)
            .filter(|(_, (_, status))| !status.is_terminal())
            .map(|(d, _)| {
                Box::pin(async move {
                    d.status.changed().await.map_err(|_| d.name.clone())
                })
            });

        let changed = tokio::select! {
            _ = cancel.cancelled() => return GateDecision::Cancelled,
            (result, _, _) = futures::future::select_all(pending) => result,
        };
        if let Err(name) = changed {
            // Sender dropped without a terminal status
            tracing::warn!("Dependency {} stopped reporting status", name);
            return GateDecision::Cancelled;
        }
    }
}
