//! Standalone servers managed through the compute API directly.
//!
//! These workflows bypass the provisioner. They only move the instance row
//! through its statuses; the cluster row is touched for its resource
//! counters alone.

use cloud_api::{CloudApiError, FloatingIp, PortForwardingRequest, PortForwardingRule, Server, ServerSpec, ServerStatus};
use orchestrator_shared_types::retry::{poll_until, Attempt, RetryPolicy};
use orchestrator_shared_types::{
    ClusterId, Instance, InstanceId, MachineStatus, OrchestrationError, Phase, PortForward, Result,
};
use rand::Rng;
use state_store_interface::ProgressTracker;
use tracing::{debug, info, warn};

use super::{failure_detail, settle_machines};
use crate::context::WorkflowContext;

pub async fn create_instance(
    ctx: &WorkflowContext,
    task_id: &str,
    cluster_id: &ClusterId,
    instance_id: &InstanceId,
) -> Result<()> {
    let tracker = ctx.tracker(task_id, *cluster_id);
    match build(ctx, &tracker, cluster_id, instance_id).await {
        Ok(()) => Ok(()),
        Err(err) => Err(fail_instance(ctx, &tracker, instance_id, err).await),
    }
}

async fn build(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster_id: &ClusterId,
    instance_id: &InstanceId,
) -> Result<()> {
    let cluster = ctx.load_cluster(cluster_id).await?;
    let mut instance = load_instance(ctx, instance_id).await?;
    let spec = ServerSpec {
        name: instance.name.clone(),
        flavor: required(&instance.flavor, "flavor")?,
        image: required(&instance.image, "image")?,
        availability_zone: instance.availability_zone.clone(),
        network_id: cluster.network.network_id.clone(),
        key_name: None,
    };

    tracker.begin(Phase::CreateServer).await?;
    let server = ctx.cloud.compute.create_server(&spec).await?;
    info!(instance_id = %instance.id, server_id = %server.id, "Server requested");
    instance.server_id = Some(server.id.clone());
    ctx.store.put_instance(instance.clone()).await?;

    let server = wait_active(ctx, &server.id).await?;
    instance.ip = server.addresses.first().cloned();

    if !instance.port_forwards.is_empty() {
        forward_ports(ctx, &mut instance, &server).await?;
    }

    instance.status = MachineStatus::Running;
    let resources = instance.resources;
    ctx.store.put_instance(instance).await?;
    tracker.succeed().await?;

    // Counters are re-read so a concurrent workflow's update is not lost.
    let mut cluster = ctx.load_cluster(cluster_id).await?;
    cluster.add_resources(&resources);
    ctx.store.put_cluster(cluster).await
}

async fn wait_active(ctx: &WorkflowContext, server_id: &str) -> Result<Server> {
    let settings = &ctx.config.instances;
    let policy = RetryPolicy::for_duration(settings.poll_timeout(), settings.poll_interval());
    let compute = &ctx.cloud.compute;

    let result = poll_until(&policy, "wait_server_active", |_| async move {
        match compute.get_server(server_id).await {
            Ok(Some(server)) if server.status == ServerStatus::Active => Attempt::Done(Ok(server)),
            Ok(Some(server)) if server.status == ServerStatus::Error => {
                let fault = server.fault.unwrap_or_else(|| "no fault reported".into());
                Attempt::Done(Err(OrchestrationError::CloudApiError(format!(
                    "server {server_id} went to ERROR: {fault}"
                ))))
            }
            Ok(Some(server)) => Attempt::Pending(server.status),
            Ok(None) => Attempt::Done(Err(OrchestrationError::CloudApiError(format!(
                "server {server_id} disappeared while building"
            )))),
            Err(e) => Attempt::Done(Err(e.into())),
        }
    })
    .await;

    match result {
        Ok(done) => done,
        Err(exhausted) => Err(OrchestrationError::CloudApiError(format!(
            "server {server_id} not active after {:?} (last status {:?})",
            exhausted.elapsed, exhausted.last
        ))),
    }
}

/// Allocate a rule on the bastion floating IP for every port that has none.
async fn forward_ports(ctx: &WorkflowContext, instance: &mut Instance, server: &Server) -> Result<()> {
    let bastion = bastion(ctx).await?;
    let port = ctx
        .cloud
        .compute
        .list_ports(&server.id)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| OrchestrationError::CloudApiError(format!("server {} has no network port", server.id)))?;
    let internal_ip = port
        .fixed_ip
        .clone()
        .or_else(|| instance.ip.clone())
        .ok_or_else(|| OrchestrationError::CloudApiError(format!("server {} has no fixed address", server.id)))?;

    instance.floating_ip = Some(bastion.address.clone());
    for index in 0..instance.port_forwards.len() {
        if instance.port_forwards[index].rule_id.is_some() {
            continue;
        }
        let rule = allocate_rule(ctx, &bastion, &port.id, &internal_ip, &instance.port_forwards[index]).await?;
        info!(
            instance_id = %instance.id,
            internal_port = rule.internal_port,
            external_port = rule.external_port,
            "Port forward allocated"
        );
        let forward = &mut instance.port_forwards[index];
        forward.external_port = Some(rule.external_port);
        forward.rule_id = Some(rule.id);
        // Each rule is stored as soon as it exists so a later failure
        // leaves the row able to release it.
        ctx.store.put_instance(instance.clone()).await?;
    }
    Ok(())
}

/// Try random external ports in the configured range until one is free.
async fn allocate_rule(
    ctx: &WorkflowContext,
    bastion: &FloatingIp,
    port_id: &str,
    internal_ip: &str,
    forward: &PortForward,
) -> Result<PortForwardingRule> {
    let settings = &ctx.config.instances;
    let policy = RetryPolicy::with_max_attempts(settings.port_attempts, settings.port_retry_interval());
    let network = &ctx.cloud.network;
    let fip_id = bastion.id.as_str();

    let result = poll_until(&policy, "allocate_port_forward", |attempt| {
        let external_port = rand::thread_rng().gen_range(settings.port_range_start..=settings.port_range_end);
        let request = PortForwardingRequest {
            internal_port_id: port_id.to_string(),
            internal_ip: internal_ip.to_string(),
            internal_port: forward.internal_port,
            external_port,
            protocol: forward.protocol.clone(),
        };
        async move {
            match network.create_port_forwarding(fip_id, &request).await {
                Ok(rule) => Attempt::Done(Ok(rule)),
                Err(CloudApiError::Conflict(msg)) => {
                    debug!(attempt, external_port, "External port taken");
                    Attempt::Pending(msg)
                }
                Err(e) => Attempt::Done(Err(e)),
            }
        }
    })
    .await;

    match result {
        Ok(done) => Ok(done?),
        Err(exhausted) => Err(OrchestrationError::CloudApiError(format!(
            "no free external port for {}/{} after {} attempts: {}",
            forward.internal_port, forward.protocol, exhausted.attempts, exhausted.last
        ))),
    }
}

/// Tear down port forwards and the server, then drop the row. A missing
/// instance row counts as already deleted.
pub async fn delete_instance(
    ctx: &WorkflowContext,
    task_id: &str,
    cluster_id: &ClusterId,
    instance_id: &InstanceId,
) -> Result<()> {
    let Some(mut instance) = ctx.store.get_instance(instance_id).await? else {
        info!(instance_id = %instance_id, "Instance already gone");
        return Ok(());
    };
    let tracker = ctx.tracker(task_id, *cluster_id);

    instance.status = MachineStatus::Deleting;
    ctx.store.put_instance(instance.clone()).await?;

    match teardown(ctx, &tracker, cluster_id, &instance).await {
        Ok(()) => Ok(()),
        Err(err) => Err(fail_instance(ctx, &tracker, instance_id, err).await),
    }
}

async fn teardown(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    cluster_id: &ClusterId,
    instance: &Instance,
) -> Result<()> {
    tracker.begin(Phase::DeleteServer).await?;

    let rules: Vec<&str> = instance
        .port_forwards
        .iter()
        .filter_map(|f| f.rule_id.as_deref())
        .collect();
    if !rules.is_empty() {
        let bastion = bastion(ctx).await?;
        for rule_id in rules {
            ctx.cloud.network.delete_port_forwarding(&bastion.id, rule_id).await?;
        }
    }

    if let Some(server_id) = &instance.server_id {
        ctx.cloud.compute.delete_server(server_id).await?;
        wait_gone(ctx, server_id).await?;
    }

    ctx.store.delete_instance(&instance.id).await?;
    tracker.succeed().await?;
    info!(instance_id = %instance.id, "Instance deleted");

    if let Some(mut cluster) = ctx.store.get_cluster(cluster_id).await? {
        cluster.sub_resources(&instance.resources);
        ctx.store.put_cluster(cluster).await?;
    }
    Ok(())
}

async fn wait_gone(ctx: &WorkflowContext, server_id: &str) -> Result<()> {
    let settings = &ctx.config.instances;
    let policy = RetryPolicy::for_duration(settings.poll_timeout(), settings.poll_interval());
    let compute = &ctx.cloud.compute;

    let result = poll_until(&policy, "wait_server_gone", |_| async move {
        match compute.get_server(server_id).await {
            Ok(None) => Attempt::Done(Ok(())),
            Ok(Some(server)) if server.status == ServerStatus::Deleted => Attempt::Done(Ok(())),
            Ok(Some(server)) => Attempt::Pending(server.status),
            Err(e) => Attempt::Done(Err(OrchestrationError::from(e))),
        }
    })
    .await;

    match result {
        Ok(done) => done,
        Err(exhausted) => Err(OrchestrationError::CloudApiError(format!(
            "server {server_id} still present after {:?} (last status {:?})",
            exhausted.elapsed, exhausted.last
        ))),
    }
}

async fn bastion(ctx: &WorkflowContext) -> Result<FloatingIp> {
    let tag = &ctx.config.openstack.bastion_tag;
    ctx.cloud
        .network
        .find_floating_ip_by_tag(tag)
        .await?
        .ok_or_else(|| OrchestrationError::CloudApiError(format!("no floating IP tagged {tag}")))
}

async fn load_instance(ctx: &WorkflowContext, instance_id: &InstanceId) -> Result<Instance> {
    ctx.store
        .get_instance(instance_id)
        .await?
        .ok_or(OrchestrationError::InstanceNotFound(*instance_id))
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| OrchestrationError::InvalidMessage(format!("instance has no {field}")))
}

async fn fail_instance(
    ctx: &WorkflowContext,
    tracker: &ProgressTracker,
    instance_id: &InstanceId,
    err: OrchestrationError,
) -> OrchestrationError {
    let detail = failure_detail(&err);
    warn!(instance_id = %instance_id, error = %detail, "Instance workflow failed");
    if tracker.current_phase().await.is_some() {
        if let Err(e) = tracker.fail(&detail).await {
            warn!(error = %e, "Could not close progress record");
        }
    }
    if let Err(e) = settle_machines(ctx, &[], &[*instance_id]).await {
        warn!(instance_id = %instance_id, error = %e, "Could not settle instance status");
    }
    err
}
