//! Worker pool executing task messages under soft and hard time limits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use observability::workflow_span;
use orchestrator_shared_types::{ClusterId, OrchestrationError, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

use super::{QueueError, TaskMessage};
use crate::context::WorkflowContext;
use crate::workflows;

/// How one execution ended.
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded,
    Failed(OrchestrationError),
    /// Never started: invalid, or the cluster is owned by another task.
    Rejected(QueueError),
}

#[derive(Debug)]
pub struct TaskReport {
    pub task_id: String,
    pub task: &'static str,
    pub cluster_id: ClusterId,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded)
    }
}

/// Runs workflows with bounded concurrency, at most one per cluster.
#[derive(Clone)]
pub struct WorkerPool {
    ctx: Arc<WorkflowContext>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<ClusterId>>>,
}

/// Holds a cluster's in-flight slot until dropped.
struct ClusterSlot {
    cluster_id: ClusterId,
    in_flight: Arc<Mutex<HashSet<ClusterId>>>,
}

impl Drop for ClusterSlot {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.cluster_id);
    }
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        let concurrency = ctx.config.workers.concurrency.max(1);
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn context(&self) -> &Arc<WorkflowContext> {
        &self.ctx
    }

    /// Validate `msg` and check that its cluster is free.
    ///
    /// A cluster in a transient status belongs to the task recorded in its
    /// `extra.task_id`; messages from any other task are rejected. A message
    /// carrying the owning task id is a redelivery and is admitted, as is
    /// any message for a transient cluster no task has claimed yet.
    pub async fn admit(&self, msg: &TaskMessage) -> std::result::Result<(), QueueError> {
        msg.validate()?;
        let cluster_id = msg.task.cluster_id();
        if let Some(cluster) = self.ctx.store.get_cluster(&cluster_id).await? {
            // Rows created at submission are transient but not yet owned.
            if let Some(owner) = cluster.task_id().filter(|_| cluster.status.is_transient()) {
                if owner != msg.task_id {
                    return Err(QueueError::ClusterBusy {
                        cluster_id,
                        status: cluster.status.to_string(),
                        owner: owner.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn claim(&self, cluster_id: ClusterId) -> std::result::Result<ClusterSlot, QueueError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(cluster_id) {
            return Err(QueueError::AlreadyRunning(cluster_id));
        }
        Ok(ClusterSlot {
            cluster_id,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Admit and run one message to completion.
    pub async fn execute(&self, msg: TaskMessage) -> TaskReport {
        let cluster_id = msg.task.cluster_id();
        let report = |outcome: TaskOutcome| TaskReport {
            task_id: msg.task_id.clone(),
            task: msg.task.name(),
            cluster_id,
            outcome,
        };

        let slot = match self.claim(cluster_id) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(task_id = %msg.task_id, error = %e, "Task rejected");
                return report(TaskOutcome::Rejected(e));
            }
        };
        if let Err(e) = self.admit(&msg).await {
            warn!(task_id = %msg.task_id, error = %e, "Task rejected");
            return report(TaskOutcome::Rejected(e));
        }

        let span = workflow_span!(msg.task.name(), cluster_id, msg.task_id);
        let result = self.run_limited(&msg).instrument(span).await;
        drop(slot);

        match result {
            Ok(()) => report(TaskOutcome::Succeeded),
            Err(e) => {
                error!(task_id = %msg.task_id, task = msg.task.name(), error = %e, "Task failed");
                report(TaskOutcome::Failed(e))
            }
        }
    }

    async fn run_limited(&self, msg: &TaskMessage) -> Result<()> {
        let limit = self.ctx.config.limits.for_task(msg.task.name());
        info!(soft = ?limit.soft(), hard = ?limit.hard(), "Task started");

        match tokio::time::timeout(limit.soft(), workflows::dispatch(&self.ctx, msg)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(soft = ?limit.soft(), "Soft time limit reached, settling task state");
                let grace = limit.hard().saturating_sub(limit.soft()).max(Duration::from_secs(1));
                match tokio::time::timeout(grace, workflows::on_soft_timeout(&self.ctx, msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Soft-timeout handler failed"),
                    Err(_) => error!(grace = ?grace, "Hard time limit reached in soft-timeout handler"),
                }
                Err(OrchestrationError::SoftTimeLimitExceeded)
            }
        }
    }

    /// Consume messages until the channel closes, then wait for running tasks.
    pub async fn run(&self, mut rx: mpsc::Receiver<TaskMessage>) -> Vec<TaskReport> {
        let mut tasks = JoinSet::new();
        let mut reports = Vec::new();

        while let Some(msg) = rx.recv().await {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Worker semaphore closed");
                    break;
                }
            };
            let pool = self.clone();
            tasks.spawn(async move {
                let report = pool.execute(msg).await;
                drop(permit);
                report
            });

            // Reap finished tasks so reports do not pile up in the set.
            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut reports);
            }
        }

        info!(running = tasks.len(), "Queue closed, draining workers");
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut reports);
        }
        reports
    }
}

fn collect(joined: std::result::Result<TaskReport, tokio::task::JoinError>, reports: &mut Vec<TaskReport>) {
    match joined {
        Ok(report) => {
            info!(
                task_id = %report.task_id,
                task = report.task,
                success = report.is_success(),
                "Task finished"
            );
            reports.push(report);
        }
        Err(e) => error!(error = %e, "Worker task panicked"),
    }
}
