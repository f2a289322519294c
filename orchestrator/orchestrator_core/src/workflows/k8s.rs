//! Kubernetes cluster creation and scale-out.

use config_runner::{KubeconfigRequest, PlaybookKind};
use infra_provisioner::{HostInventory, HostVars, TfVars};
use orchestrator_shared_types::{
    Cluster, ClusterStatus, MachineStatus, NodeId, OrchestrationError, Phase, Result,
};
use state_store_interface::ProgressTracker;
use tracing::{info, warn};

use super::{record_failure, start};
use crate::context::WorkflowContext;

const API_SERVER_PORT: u16 = 6443;

/// Arguments of a `create_k8s_cluster` task.
pub struct K8sRequest {
    pub cluster: Cluster,
    pub description: TfVars,
    pub node_ids: Vec<NodeId>,
    pub scale: bool,
    pub limit_hosts: Vec<String>,
}

/// Provision machines, configure Kubernetes on them and record the result.
///
/// With `scale` set the machines in `description` are added to an existing
/// cluster: the persisted description is extended, connectivity is checked
/// and the scale playbook runs only for the new hosts (or `limit_hosts`),
/// and the kubeconfig is left untouched.
pub async fn create_k8s_cluster(ctx: &WorkflowContext, task_id: &str, request: K8sRequest) -> Result<()> {
    let K8sRequest {
        mut cluster,
        description,
        node_ids,
        scale,
        limit_hosts,
    } = request;

    let (transient, failure) = if scale {
        (ClusterStatus::Scaling, ClusterStatus::ScaleError)
    } else {
        (ClusterStatus::Creating, ClusterStatus::Error)
    };
    if scale {
        // The stored row carries the kubeconfig and counters of earlier runs.
        if let Some(stored) = ctx.store.get_cluster(&cluster.id).await? {
            cluster = stored;
        }
    }
    start(ctx, &mut cluster, transient, task_id).await?;
    let tracker = ctx.tracker(task_id, cluster.id);

    let new_hosts: Vec<String> = description.nodes.keys().cloned().collect();
    let limit = if limit_hosts.is_empty() { new_hosts } else { limit_hosts };

    match run(ctx, &tracker, &mut cluster, description, &node_ids, scale, limit).await {
        Ok(()) => {
            info!(cluster_id = %cluster.id, scale, nodes = node_ids.len(), "Kubernetes workflow finished");
            Ok(())
        }
        Err(err) => Err(record_failure(ctx, &tracker, &mut cluster, failure, &node_ids, &[], err).await),
    }
}

async fn run(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster: &mut Cluster,
    description: TfVars,
    node_ids: &[NodeId],
    scale: bool,
    limit: Vec<String>,
) -> Result<()> {
    let paths = ctx.paths(&cluster.id);
    let mut desc = if scale {
        let mut existing = ctx.provisioner.load_description(&cluster.id).await?;
        existing.nodes.extend(description.nodes);
        existing
    } else {
        description
    };
    ctx.refresh_credentials(&mut desc).await?;

    tracker.begin(Phase::ProvisionInfrastructure).await?;
    let outcome = ctx.provisioner.provision(cluster, &mut desc, tracker, scale).await?;
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
    let targets = if scale { inventory.subset(limit.as_slice()) } else { inventory.clone() };
    let ping = ctx.ping_request(&paths, &desc);
    ctx.prober
        .probe(
            &targets,
            &ping,
            ctx.config.reachability.max_wait(),
            ctx.config.reachability.interval(),
        )
        .await?;

    let kind = if scale { PlaybookKind::Scale } else { PlaybookKind::Cluster };
    let mut run_request = ctx.playbook_request(kind, &paths, &desc);
    if scale {
        run_request = run_request.limit(limit);
    }
    let outcome = ctx.runner.run(&run_request, tracker).await?;
    if !outcome.ok {
        return Err(OrchestrationError::RunnerError(outcome.message));
    }

    if !scale {
        tracker.begin(Phase::FetchKubeconfig).await?;
        fetch_kubeconfig(ctx, cluster, &inventory, &desc).await?;
    }

    let added = sync_nodes(ctx, cluster, &inventory, node_ids).await?;
    cluster.bump_node_count(added);
    tracker.succeed().await?;
    cluster.set_status(ClusterStatus::Running, "");
    ctx.store.put_cluster(cluster.clone()).await
}

async fn fetch_kubeconfig(
    ctx: &WorkflowContext,
    cluster: &mut Cluster,
    inventory: &HostInventory,
    desc: &TfVars,
) -> Result<()> {
    let paths = ctx.paths(&cluster.id);
    let master = inventory
        .first_master()
        .ok_or_else(|| OrchestrationError::InventoryError("inventory has no control-plane host".into()))?;
    let public_address = inventory
        .get(&master)
        .and_then(HostVars::public_address)
        .map(str::to_string);

    let kubeconfig = ctx
        .runner
        .fetch_kubeconfig(&KubeconfigRequest {
            inventory: paths.hosts_script(),
            master: master.clone(),
            ssh_key: (!desc.uses_password()).then(|| paths.private_key()),
            user: ctx.ssh_user(desc),
            working_dir: paths.root().to_path_buf(),
            public_address: public_address.clone(),
        })
        .await?;

    info!(cluster_id = %cluster.id, master = %master, "Fetched kubeconfig");
    cluster.kube_info.kubeconfig = Some(kubeconfig);
    cluster.kube_info.api_server = public_address.map(|a| format!("https://{a}:{API_SERVER_PORT}"));
    Ok(())
}

/// Copy server ids and addresses from the inventory onto the node rows and
/// mark them running. Returns how many nodes were brought up.
async fn sync_nodes(
    ctx: &WorkflowContext,
    cluster: &mut Cluster,
    inventory: &HostInventory,
    node_ids: &[NodeId],
) -> Result<u64> {
    let mut added = 0;
    for id in node_ids {
        let Some(mut node) = ctx.store.get_node(id).await? else {
            warn!(node_id = %id, "Node row vanished before sync");
            continue;
        };
        let vars = inventory.get(&node.name).ok_or_else(|| {
            OrchestrationError::InventoryError(format!("{} is missing from the inventory", node.name))
        })?;
        node.server_id = vars.provider_id.clone();
        node.ip = vars.ip.clone();
        node.floating_ip = vars.access_ip.clone();
        node.status = MachineStatus::Running;
        cluster.add_resources(&node.resources);
        ctx.store.put_node(node).await?;
        added += 1;
    }
    Ok(added)
}
