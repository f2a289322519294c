//! Bare-metal pools: provisioned machines without a Kubernetes layer.

use infra_provisioner::{HostInventory, TfVars};
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterStatus, Instance, InstanceId, MachineStatus, OrchestrationError, Phase,
    Resources, Result,
};
use state_store_interface::ProgressTracker;
use tracing::{info, warn};

use super::delete::release_infrastructure;
use super::{record_failure, start};
use crate::context::WorkflowContext;

pub async fn create_cluster(
    ctx: &WorkflowContext,
    task_id: &str,
    mut cluster: Cluster,
    description: TfVars,
    instance_ids: &[InstanceId],
) -> Result<()> {
    start(ctx, &mut cluster, ClusterStatus::Creating, task_id).await?;
    let tracker = ctx.tracker(task_id, cluster.id);

    match provision_pool(ctx, &tracker, &mut cluster, description, instance_ids).await {
        Ok(()) => Ok(()),
        Err(err) => Err(record_failure(ctx, &tracker, &mut cluster, ClusterStatus::Error, &[], instance_ids, err).await),
    }
}

async fn provision_pool(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster: &mut Cluster,
    mut desc: TfVars,
    instance_ids: &[InstanceId],
) -> Result<()> {
    let paths = ctx.paths(&cluster.id);
    ctx.refresh_credentials(&mut desc).await?;

    tracker.begin(Phase::ProvisionInfrastructure).await?;
    let outcome = ctx.provisioner.provision(cluster, &mut desc, tracker, false).await?;
    if !outcome.ok {
        return Err(OrchestrationError::ProvisionError(outcome.message));
    }
    ctx.store.put_cluster(cluster.clone()).await?;

    tracker.begin(Phase::ResolveInventory).await?;
    let inventory = ctx
        .inventory
        .resolve(&paths.hosts_script(), paths.root())
        .await?;

    tracker.begin(Phase::CheckConnectivity).await?;
    ctx.prober
        .probe(
            &inventory,
            &ctx.ping_request(&paths, &desc),
            ctx.config.reachability.max_wait(),
            ctx.config.reachability.interval(),
        )
        .await?;

    let added = sync_instances(ctx, cluster, &inventory, instance_ids).await?;
    cluster.bump_node_count(added);
    tracker.succeed().await?;
    info!(cluster_id = %cluster.id, instances = added, "Bare-metal pool ready");

    cluster.set_status(ClusterStatus::Running, "");
    ctx.store.put_cluster(cluster.clone()).await
}

async fn sync_instances(
    ctx: &WorkflowContext,
    cluster: &mut Cluster,
    inventory: &HostInventory,
    instance_ids: &[InstanceId],
) -> Result<u64> {
    let mut added = 0;
    for id in instance_ids {
        let Some(mut instance) = ctx.store.get_instance(id).await? else {
            warn!(instance_id = %id, "Instance row vanished before sync");
            continue;
        };
        let vars = inventory.get(&instance.name).ok_or_else(|| {
            OrchestrationError::InventoryError(format!("{} is missing from the inventory", instance.name))
        })?;
        instance.server_id = vars.provider_id.clone();
        instance.ip = vars.ip.clone();
        instance.floating_ip = vars.access_ip.clone();
        instance.status = MachineStatus::Running;
        cluster.add_resources(&instance.resources);
        ctx.store.put_instance(instance).await?;
        added += 1;
    }
    Ok(added)
}

/// Remove machines from a bare-metal pool.
pub async fn delete_baremetal(
    ctx: &WorkflowContext,
    task_id: &str,
    cluster_id: &ClusterId,
    instance_ids: &[InstanceId],
) -> Result<()> {
    let mut cluster = ctx.load_cluster(cluster_id).await?;
    start(ctx, &mut cluster, ClusterStatus::Removing, task_id).await?;
    let tracker = ctx.tracker(task_id, cluster.id);

    match shrink_pool(ctx, &tracker, &mut cluster, instance_ids).await {
        Ok(()) => Ok(()),
        Err(err) => Err(record_failure(ctx, &tracker, &mut cluster, ClusterStatus::RemoveError, &[], instance_ids, err).await),
    }
}

async fn shrink_pool(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster: &mut Cluster,
    instance_ids: &[InstanceId],
) -> Result<()> {
    let mut instances: Vec<Instance> = Vec::new();
    for id in instance_ids {
        match ctx.store.get_instance(id).await? {
            Some(instance) if instance.cluster_id == cluster.id => instances.push(instance),
            _ => warn!(cluster_id = %cluster.id, instance_id = %id, "Instance not part of cluster, skipping"),
        }
    }
    if instances.is_empty() {
        info!(cluster_id = %cluster.id, "No instances left to remove");
        cluster.set_status(ClusterStatus::Running, "");
        return ctx.store.put_cluster(cluster.clone()).await;
    }

    for instance in &mut instances {
        instance.status = MachineStatus::Deleting;
        ctx.store.put_instance(instance.clone()).await?;
    }
    let names: Vec<String> = instances.iter().map(|i| i.name.clone()).collect();

    tracker.begin(Phase::ReleaseInfrastructure).await?;
    release_infrastructure(ctx, tracker, cluster, &names).await?;

    for instance in &instances {
        ctx.store.delete_instance(&instance.id).await?;
    }
    cluster.sub_resources(&Resources::sum(instances.iter().map(|i| &i.resources)));
    tracker.succeed().await?;
    info!(cluster_id = %cluster.id, removed = ?names, "Instances removed");

    cluster.set_status(ClusterStatus::Running, "");
    ctx.store.put_cluster(cluster.clone()).await
}
