//! Worker pool behaviour: admission, time limits, and the standalone
//! instance workflows that run outside the provisioner.

mod common;

use std::time::Duration;

use cloud_api::MockCloud;
use common::{description, Harness, CLUSTER, NODE_SHAPE};
use config_runner::MockPing;
use engine_config::TimeLimit;
use infra_provisioner::MachineGroup;
use state_store_interface::StateStore;
use orchestrator_core::{QueueError, Task, TaskMessage, TaskOutcome, SCHEMA_VERSION, SOFT_TIME_LIMIT_MSG};
use orchestrator_shared_types::{
    Cluster, ClusterStatus, Instance, MachineStatus, NodeRole, OrchestrationError, PortForward, TaskState,
};

fn create_task(cluster: &Cluster, node_ids: Vec<orchestrator_shared_types::NodeId>) -> Task {
    Task::CreateK8sCluster {
        cluster: cluster.clone(),
        description: description(
            cluster,
            &[
                ("c1-master-1", MachineGroup::Master),
                ("c1-node-1", MachineGroup::Worker),
                ("c1-node-2", MachineGroup::Worker),
            ],
        ),
        node_ids,
        scale: false,
        limit_hosts: Vec::new(),
    }
}

fn creating_nodes() -> Vec<(&'static str, NodeRole, MachineStatus)> {
    vec![
        ("c1-master-1", NodeRole::Master, MachineStatus::Creating),
        ("c1-node-1", NodeRole::Worker, MachineStatus::Creating),
        ("c1-node-2", NodeRole::Worker, MachineStatus::Creating),
    ]
}

// ============================================================================
// Admission and limits
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_soft_time_limit_settles_state() {
    let h = Harness::builder()
        .ping(MockPing::new().never_reachable(["c1-node-2"]))
        .configure(|config| {
            config.reachability.max_wait_secs = 3600;
            config.reachability.interval_secs = 5;
            config.limits.tasks.insert(
                "create_k8s_cluster".into(),
                TimeLimit {
                    soft_secs: 10,
                    hard_secs: 20,
                },
            );
        })
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &creating_nodes()).await;

    let report = h.execute("task-slow", create_task(&cluster, node_ids.clone())).await;
    assert!(
        matches!(report.outcome, TaskOutcome::Failed(OrchestrationError::SoftTimeLimitExceeded)),
        "{:?}",
        report.outcome
    );

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Error);
    assert_eq!(stored.status_msg, SOFT_TIME_LIMIT_MSG);

    let records = h.records("task-slow").await;
    let last = records.last().unwrap();
    assert_eq!(last.msg, "check connectivity");
    assert_eq!(last.state, TaskState::Failed);
    assert_eq!(last.detail, SOFT_TIME_LIMIT_MSG);

    for id in &node_ids {
        assert_eq!(h.node(id).await.unwrap().status, MachineStatus::Error);
    }
    h.assert_settled(&cluster.id, "task-slow").await;
}

#[tokio::test]
async fn test_cluster_owned_by_other_task_is_rejected() {
    let h = Harness::new();
    let (mut cluster, _) = h.seed_cluster(ClusterStatus::Deleting, &[]).await;
    cluster.set_task_id("task-other");
    h.store_cluster(&cluster).await;

    let report = h
        .execute("task-mine", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    match report.outcome {
        TaskOutcome::Rejected(QueueError::ClusterBusy { owner, .. }) => assert_eq!(owner, "task-other"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(h.records("task-mine").await.is_empty());
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Deleting);
}

#[tokio::test]
async fn test_redelivery_to_owning_task_is_admitted() {
    let h = Harness::new();
    let (mut cluster, _) = h.seed_cluster(ClusterStatus::Deleting, &[]).await;
    cluster.set_task_id("task-del");
    h.store_cluster(&cluster).await;

    let report = h
        .execute("task-del", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Deleted);
}

#[tokio::test(start_paused = true)]
async fn test_second_task_for_running_cluster_is_rejected() {
    let h = Harness::builder()
        .ping(MockPing::new().reachable_after(3))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &creating_nodes()).await;

    let first = tokio::spawn({
        let pool = h.pool.clone();
        let msg = TaskMessage::new("task-a", create_task(&cluster, node_ids));
        async move { pool.execute(msg).await }
    });
    while h.ping.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let second = h
        .execute("task-b", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    assert!(
        matches!(second.outcome, TaskOutcome::Rejected(QueueError::AlreadyRunning(id)) if id == cluster.id),
        "{:?}",
        second.outcome
    );

    let first = first.await.unwrap();
    assert!(first.is_success(), "{:?}", first.outcome);
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Running);
}

#[tokio::test]
async fn test_unsupported_schema_version_is_rejected() {
    let h = Harness::new();
    let (cluster, _) = h.seed_cluster(ClusterStatus::Running, &[]).await;
    let mut msg = TaskMessage::new("task-v", Task::DeleteCluster { cluster_id: cluster.id });
    msg.schema_version = SCHEMA_VERSION + 1;

    let report = h.pool.execute(msg).await;
    assert!(
        matches!(report.outcome, TaskOutcome::Rejected(QueueError::UnsupportedVersion { .. })),
        "{:?}",
        report.outcome
    );
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Running);
}

#[tokio::test]
async fn test_pool_drains_channel_and_reports_each_task() {
    let h = Harness::new();
    let (tx, rx) = tokio::sync::mpsc::channel(4);

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let cluster = Cluster::new(name, ClusterStatus::Running);
        ids.push(cluster.id);
        h.store_cluster(&cluster).await;
        tx.send(TaskMessage::new(format!("task-{name}"), Task::DeleteCluster { cluster_id: cluster.id }))
            .await
            .unwrap();
    }
    drop(tx);

    let reports = h.pool.run(rx).await;
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.is_success()));
    for id in &ids {
        assert_eq!(h.cluster(id).await.status, ClusterStatus::Deleted);
    }
}

// ============================================================================
// Standalone instances
// ============================================================================

async fn seed_instance(h: &Harness, cluster: &Cluster, forwards: &[u16]) -> Instance {
    let mut instance = Instance::new(cluster.id, format!("{CLUSTER}-vm-1"));
    instance.flavor = Some("m1.small".into());
    instance.image = Some("ubuntu-22.04".into());
    instance.resources = NODE_SHAPE;
    instance.port_forwards = forwards
        .iter()
        .map(|port| PortForward {
            internal_port: *port,
            protocol: "tcp".into(),
            external_port: None,
            rule_id: None,
        })
        .collect();
    h.store.put_instance(instance.clone()).await.unwrap();
    instance
}

fn single_port(config: &mut engine_config::EngineConfig) {
    config.instances.port_range_start = 30000;
    config.instances.port_range_end = 30000;
    config.instances.port_attempts = 3;
    config.instances.port_retry_interval_ms = 10;
}

#[tokio::test(start_paused = true)]
async fn test_create_instance_with_port_forward() {
    let h = Harness::builder()
        .cloud(MockCloud::new().with_activation_polls(2))
        .configure(single_port)
        .build();
    let (cluster, _) = h.seed_cluster(ClusterStatus::Running, &[]).await;
    let instance = seed_instance(&h, &cluster, &[22]).await;

    let report = h
        .execute(
            "task-vm",
            Task::CreateInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);

    let stored = h.instance(&instance.id).await.unwrap();
    assert_eq!(stored.status, MachineStatus::Running);
    assert_eq!(stored.server_id.as_deref(), Some("srv-1"));
    assert_eq!(stored.ip.as_deref(), Some("10.0.0.11"));
    assert_eq!(stored.floating_ip.as_deref(), Some("203.0.113.10"));
    assert_eq!(stored.port_forwards[0].external_port, Some(30000));
    assert_eq!(stored.port_forwards[0].rule_id.as_deref(), Some("pf-30000"));

    let updated = h.cluster(&cluster.id).await;
    assert_eq!(updated.cpu, NODE_SHAPE.cpu);
    assert_eq!(updated.status, ClusterStatus::Running);

    let records = h.records("task-vm").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].msg, "create server");
    assert_eq!(records[0].state, TaskState::Success);
}

#[tokio::test(start_paused = true)]
async fn test_port_exhaustion_fails_instance() {
    let h = Harness::builder().configure(single_port).build();
    h.cloud.take_ports([30000]).await;
    let (cluster, _) = h.seed_cluster(ClusterStatus::Running, &[]).await;
    let instance = seed_instance(&h, &cluster, &[22]).await;

    let report = h
        .execute(
            "task-full",
            Task::CreateInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    match &report.outcome {
        TaskOutcome::Failed(OrchestrationError::CloudApiError(msg)) => {
            assert!(msg.contains("no free external port"), "{msg}")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.cloud.port_attempts(), 3);

    assert_eq!(h.instance(&instance.id).await.unwrap().status, MachineStatus::Error);
    let records = h.records("task-full").await;
    assert_eq!(records[0].msg, "create server");
    assert_eq!(records[0].state, TaskState::Failed);

    // Instance failures never touch the cluster status.
    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Running);
    assert_eq!(stored.cpu, 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_port_allocation_is_released_on_delete() {
    let h = Harness::builder().configure(single_port).build();
    let (cluster, _) = h.seed_cluster(ClusterStatus::Running, &[]).await;
    let instance = seed_instance(&h, &cluster, &[22, 80]).await;

    // The single external port goes to the first forward; the second runs dry.
    let created = h
        .execute(
            "task-two-ports",
            Task::CreateInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    assert!(
        matches!(created.outcome, TaskOutcome::Failed(OrchestrationError::CloudApiError(_))),
        "{:?}",
        created.outcome
    );
    assert_eq!(h.cloud.rule_count().await, 1);

    let stored = h.instance(&instance.id).await.unwrap();
    assert_eq!(stored.status, MachineStatus::Error);
    assert_eq!(stored.port_forwards[0].rule_id.as_deref(), Some("pf-30000"));
    assert_eq!(stored.port_forwards[0].external_port, Some(30000));
    assert_eq!(stored.port_forwards[1].rule_id, None);

    let deleted = h
        .execute(
            "task-cleanup",
            Task::DeleteInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    assert!(deleted.is_success(), "{:?}", deleted.outcome);
    assert_eq!(h.cloud.rule_count().await, 0);
    assert_eq!(h.cloud.server_count().await, 0);
    assert!(h.instance(&instance.id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_server_error_fails_instance() {
    let h = Harness::builder().cloud(MockCloud::new().failing_activation()).build();
    let (cluster, _) = h.seed_cluster(ClusterStatus::Running, &[]).await;
    let instance = seed_instance(&h, &cluster, &[]).await;

    let report = h
        .execute(
            "task-err",
            Task::CreateInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    match &report.outcome {
        TaskOutcome::Failed(OrchestrationError::CloudApiError(msg)) => {
            assert!(msg.contains("No valid host was found"), "{msg}")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.instance(&instance.id).await.unwrap().status, MachineStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_delete_instance_releases_rules_and_server() {
    let h = Harness::builder()
        .cloud(MockCloud::new().with_vanish_polls(2))
        .configure(single_port)
        .build();
    let (cluster, _) = h.seed_cluster(ClusterStatus::Running, &[]).await;
    let instance = seed_instance(&h, &cluster, &[22]).await;

    let created = h
        .execute(
            "task-up",
            Task::CreateInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    assert!(created.is_success(), "{:?}", created.outcome);
    assert_eq!(h.cloud.rule_count().await, 1);

    let deleted = h
        .execute(
            "task-down",
            Task::DeleteInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    assert!(deleted.is_success(), "{:?}", deleted.outcome);

    assert!(h.instance(&instance.id).await.is_none());
    assert_eq!(h.cloud.rule_count().await, 0);
    assert_eq!(h.cloud.server_count().await, 0);
    assert_eq!(h.cluster(&cluster.id).await.cpu, 0);

    let records = h.records("task-down").await;
    assert_eq!(records[0].msg, "delete server");
    assert_eq!(records[0].state, TaskState::Success);

    // The row is gone, so a redelivery does nothing.
    let again = h
        .execute(
            "task-down",
            Task::DeleteInstance {
                cluster_id: cluster.id,
                instance_id: instance.id,
            },
        )
        .await;
    assert!(again.is_success());
    assert_eq!(h.records("task-down").await.len(), 1);
}

#[tokio::test]
async fn test_soft_limit_defaults_cover_every_task() {
    let h = Harness::new();
    let limits = &h.pool.context().config.limits;
    for name in [
        "create_cluster",
        "create_k8s_cluster",
        "delete_cluster",
        "delete_node",
        "delete_baremetal",
        "create_instance",
        "delete_instance",
    ] {
        let limit = limits.for_task(name);
        assert!(limit.soft() < limit.hard(), "{name}");
        assert!(limit.soft() >= Duration::from_secs(60), "{name}");
    }
}
