//! Lifecycle workflows.
//!
//! Every workflow runs one task message to completion: it moves the cluster
//! into its transient status, walks its phases through a `ProgressTracker`,
//! and on any exit path leaves the cluster and its machines in a terminal or
//! `*_error` status. Failures are written to the entities and progress
//! records first and then returned to the worker pool.

mod baremetal;
mod delete;
mod instance;
mod k8s;

pub use baremetal::{create_cluster, delete_baremetal};
pub use delete::{delete_cluster, delete_node};
pub use instance::{create_instance, delete_instance};
pub use k8s::{create_k8s_cluster, K8sRequest};

use orchestrator_shared_types::{
    Cluster, ClusterStatus, InstanceId, MachineStatus, NodeId, OrchestrationError, Result,
};
use state_store_interface::ProgressTracker;
use tracing::{error, warn};

use crate::context::WorkflowContext;
use crate::queue::{Task, TaskMessage};

/// Status message and progress detail written when a task hits its soft limit.
pub const SOFT_TIME_LIMIT_MSG: &str = "task exceeded its soft time limit";

/// Route a validated message to its workflow.
pub async fn dispatch(ctx: &WorkflowContext, msg: &TaskMessage) -> Result<()> {
    let task_id = msg.task_id.as_str();
    match &msg.task {
        Task::CreateCluster {
            cluster,
            description,
            instance_ids,
        } => create_cluster(ctx, task_id, cluster.clone(), description.clone(), instance_ids).await,
        Task::CreateK8sCluster {
            cluster,
            description,
            node_ids,
            scale,
            limit_hosts,
        } => {
            let request = K8sRequest {
                cluster: cluster.clone(),
                description: description.clone(),
                node_ids: node_ids.clone(),
                scale: *scale,
                limit_hosts: limit_hosts.clone(),
            };
            create_k8s_cluster(ctx, task_id, request).await
        }
        Task::DeleteCluster { cluster_id } => delete_cluster(ctx, task_id, cluster_id).await,
        Task::DeleteNode { cluster_id, node_ids } => delete_node(ctx, task_id, cluster_id, node_ids).await,
        Task::DeleteBaremetal {
            cluster_id,
            instance_ids,
        } => delete_baremetal(ctx, task_id, cluster_id, instance_ids).await,
        Task::CreateInstance {
            cluster_id,
            instance_id,
        } => create_instance(ctx, task_id, cluster_id, instance_id).await,
        Task::DeleteInstance {
            cluster_id,
            instance_id,
        } => delete_instance(ctx, task_id, cluster_id, instance_id).await,
    }
}

/// Settle state after the workflow future was dropped at the soft limit.
///
/// Closes the open progress record as `failed`, moves a cluster still in a
/// transient status to the task's failure status and marks transient
/// machines of the message as `error`.
pub async fn on_soft_timeout(ctx: &WorkflowContext, msg: &TaskMessage) -> Result<()> {
    let cluster_id = msg.task.cluster_id();
    let tracker = ProgressTracker::resume(ctx.store.clone(), msg.task_id.as_str(), cluster_id).await?;
    tracker.fail(SOFT_TIME_LIMIT_MSG).await?;

    if let Some(status) = msg.task.failure_status() {
        if let Some(mut cluster) = ctx.store.get_cluster(&cluster_id).await? {
            if cluster.status.is_transient() {
                cluster.set_status(status, SOFT_TIME_LIMIT_MSG);
                ctx.store.put_cluster(cluster).await?;
            }
        }
    }
    settle_machines(ctx, msg.task.node_ids(), &msg.task.instance_ids()).await
}

/// Text written to `status_msg` and the failed progress record.
///
/// Tool and cloud failures keep their diagnostic verbatim; other errors use
/// their display form.
pub(crate) fn failure_detail(err: &OrchestrationError) -> String {
    match err {
        OrchestrationError::ProvisionError(m)
        | OrchestrationError::InventoryError(m)
        | OrchestrationError::ReachabilityError(m)
        | OrchestrationError::RunnerError(m)
        | OrchestrationError::CloudApiError(m) => m.clone(),
        OrchestrationError::SoftTimeLimitExceeded => SOFT_TIME_LIMIT_MSG.to_string(),
        other => other.to_string(),
    }
}

/// Record `err` on the progress record, the cluster and the task's machines,
/// then hand it back for propagation.
///
/// Persistence failures while recording are logged; the original error wins.
pub(crate) async fn record_failure(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster: &mut Cluster,
    status: ClusterStatus,
    node_ids: &[NodeId],
    instance_ids: &[InstanceId],
    err: OrchestrationError,
) -> OrchestrationError {
    let detail = failure_detail(&err);
    error!(
        cluster_id = %cluster.id,
        task_id = %tracker.task_id(),
        status = %status,
        error = %detail,
        "Workflow failed"
    );

    if tracker.current_phase().await.is_some() {
        if let Err(e) = tracker.fail(&detail).await {
            warn!(error = %e, "Could not close progress record");
        }
    }

    cluster.set_status(status, detail);
    if let Err(e) = ctx.store.put_cluster(cluster.clone()).await {
        warn!(cluster_id = %cluster.id, error = %e, "Could not persist failure status");
    }
    if let Err(e) = settle_machines(ctx, node_ids, instance_ids).await {
        warn!(cluster_id = %cluster.id, error = %e, "Could not settle machine status");
    }
    err
}

/// Move transient nodes and instances among the given ids to `error`.
pub(crate) async fn settle_machines(
    ctx: &WorkflowContext,
    node_ids: &[NodeId],
    instance_ids: &[InstanceId],
) -> Result<()> {
    for id in node_ids {
        if let Some(mut node) = ctx.store.get_node(id).await? {
            if node.status.is_transient() {
                node.status = MachineStatus::Error;
                ctx.store.put_node(node).await?;
            }
        }
    }
    for id in instance_ids {
        if let Some(mut instance) = ctx.store.get_instance(id).await? {
            if instance.status.is_transient() {
                instance.status = MachineStatus::Error;
                ctx.store.put_instance(instance).await?;
            }
        }
    }
    Ok(())
}

/// Enter the workflow's transient status under `task_id` and persist it.
pub(crate) async fn start(
    ctx: &WorkflowContext,
    cluster: &mut Cluster,
    status: ClusterStatus,
    task_id: &str,
) -> Result<()> {
    cluster.set_status(status, "");
    cluster.set_task_id(task_id);
    ctx.store.put_cluster(cluster.clone()).await
}
