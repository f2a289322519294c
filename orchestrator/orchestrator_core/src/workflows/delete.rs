//! Cluster teardown and Kubernetes node removal.

use config_runner::PlaybookKind;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterStatus, MachineStatus, Node, NodeId, OrchestrationError, Phase,
    Resources, Result,
};
use state_store_interface::ProgressTracker;
use tracing::{info, warn};

use super::{record_failure, start};
use crate::context::WorkflowContext;

/// Destroy every resource of the cluster and mark it `deleted`.
///
/// A cluster that is already deleted, or whose working directory is gone,
/// is settled without touching the provisioner.
pub async fn delete_cluster(ctx: &WorkflowContext, task_id: &str, cluster_id: &ClusterId) -> Result<()> {
    let mut cluster = ctx.load_cluster(cluster_id).await?;
    if cluster.status == ClusterStatus::Deleted {
        info!(cluster_id = %cluster_id, "Cluster already deleted");
        return Ok(());
    }
    start(ctx, &mut cluster, ClusterStatus::Deleting, task_id).await?;
    let tracker = ctx.tracker(task_id, cluster.id);

    match destroy(ctx, &tracker, &mut cluster).await {
        Ok(()) => Ok(()),
        Err(err) => Err(record_failure(ctx, &tracker, &mut cluster, ClusterStatus::DeleteError, &[], &[], err).await),
    }
}

async fn destroy(ctx: &WorkflowContext, tracker: &ProgressTracker, cluster: &mut Cluster) -> Result<()> {
    tracker.begin(Phase::DestroyInfrastructure).await?;

    let mut note = String::new();
    if ctx.provisioner.workdir_exists(&cluster.id) {
        let mut desc = ctx.provisioner.load_description(&cluster.id).await?;
        ctx.refresh_credentials(&mut desc).await?;
        ctx.provisioner.save_description(&cluster.id, &desc).await?;

        let outcome = ctx.provisioner.destroy(&cluster.id, tracker).await?;
        if !outcome.ok {
            return Err(OrchestrationError::ProvisionError(outcome.message));
        }
        note = outcome.message;
    } else {
        info!(cluster_id = %cluster.id, "No working directory, nothing to destroy");
    }

    ctx.store.delete_nodes_for_cluster(&cluster.id).await?;
    ctx.store.delete_instances_for_cluster(&cluster.id).await?;
    tracker.succeed().await?;

    cluster.set_status(ClusterStatus::Deleted, note);
    cluster.cpu = 0;
    cluster.mem = 0;
    cluster.gpu = 0;
    ctx.store.put_cluster(cluster.clone()).await?;

    match ctx.provisioner.retire_workdir(&cluster.id).await {
        Ok(Some(path)) => info!(cluster_id = %cluster.id, path = %path.display(), "Working directory retired"),
        Ok(None) => {}
        Err(e) => warn!(cluster_id = %cluster.id, error = %e, "Could not retire working directory"),
    }
    Ok(())
}

/// Drain nodes from Kubernetes, then shrink the infrastructure.
///
/// Node ids without a row are skipped; when none remain the cluster goes
/// straight back to `running`.
pub async fn delete_node(
    ctx: &WorkflowContext,
    task_id: &str,
    cluster_id: &ClusterId,
    node_ids: &[NodeId],
) -> Result<()> {
    let mut cluster = ctx.load_cluster(cluster_id).await?;
    start(ctx, &mut cluster, ClusterStatus::Removing, task_id).await?;
    let tracker = ctx.tracker(task_id, cluster.id);

    match remove_nodes(ctx, &tracker, &mut cluster, node_ids).await {
        Ok(()) => Ok(()),
        Err(err) => Err(record_failure(ctx, &tracker, &mut cluster, ClusterStatus::RemoveError, node_ids, &[], err).await),
    }
}

async fn remove_nodes(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster: &mut Cluster,
    node_ids: &[NodeId],
) -> Result<()> {
    let mut nodes: Vec<Node> = Vec::new();
    for id in node_ids {
        match ctx.store.get_node(id).await? {
            Some(node) if node.cluster_id == cluster.id => nodes.push(node),
            _ => warn!(cluster_id = %cluster.id, node_id = %id, "Node not part of cluster, skipping"),
        }
    }
    if nodes.is_empty() {
        info!(cluster_id = %cluster.id, "No nodes left to remove");
        cluster.set_status(ClusterStatus::Running, "");
        return ctx.store.put_cluster(cluster.clone()).await;
    }

    for node in &mut nodes {
        node.status = MachineStatus::Deleting;
        ctx.store.put_node(node.clone()).await?;
    }
    let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();

    let paths = ctx.paths(&cluster.id);
    let desc = ctx.provisioner.load_description(&cluster.id).await?;
    let request = ctx
        .playbook_request(PlaybookKind::RemoveNode, &paths, &desc)
        .extra_var("node", names.join(","));
    let outcome = ctx.runner.run(&request, tracker).await?;
    if !outcome.ok {
        return Err(OrchestrationError::RunnerError(outcome.message));
    }

    tracker.begin(Phase::ReleaseInfrastructure).await?;
    release_infrastructure(ctx, tracker, cluster, &names).await?;

    for node in &nodes {
        ctx.store.delete_node(&node.id).await?;
    }
    cluster.sub_resources(&Resources::sum(nodes.iter().map(|n| &n.resources)));
    tracker.succeed().await?;
    info!(cluster_id = %cluster.id, removed = ?names, "Nodes removed");

    cluster.set_status(ClusterStatus::Running, "");
    ctx.store.put_cluster(cluster.clone()).await
}

/// Forget `names` in the provisioner state and description, then re-apply
/// so the machines are destroyed.
pub(crate) async fn release_infrastructure(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster: &mut Cluster,
    names: &[String],
) -> Result<()> {
    let mut desc = ctx.provisioner.remove_nodes(&cluster.id, names).await?;
    ctx.refresh_credentials(&mut desc).await?;
    ctx.provisioner.save_description(&cluster.id, &desc).await?;

    let outcome = ctx.provisioner.provision(cluster, &mut desc, tracker, true).await?;
    if !outcome.ok {
        return Err(OrchestrationError::ProvisionError(outcome.message));
    }
    Ok(())
}
