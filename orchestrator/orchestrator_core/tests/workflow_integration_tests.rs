//! End-to-end workflow runs against mock collaborators.
//!
//! Each test drives one task message through the worker pool and checks the
//! entity rows, the progress records and the calls the workflow made.

mod common;

use common::{description, phases, Harness, CLUSTER, NODE_SHAPE};
use config_runner::{MockPing, MockRunner, PlaybookKind};
use infra_provisioner::mock::ProvisionerCall;
use infra_provisioner::{MachineGroup, MockInventory, MockProvisioner, Provisioner};
use orchestrator_core::{Task, TaskOutcome};
use orchestrator_shared_types::{
    ClusterStatus, MachineStatus, NodeRole, OrchestrationError, TaskState,
};

const MASTER: &str = "c1-master-1";
const NODE_1: &str = "c1-node-1";
const NODE_2: &str = "c1-node-2";

fn new_cluster_machines() -> Vec<(&'static str, NodeRole, MachineStatus)> {
    vec![
        (MASTER, NodeRole::Master, MachineStatus::Creating),
        (NODE_1, NodeRole::Worker, MachineStatus::Creating),
        (NODE_2, NodeRole::Worker, MachineStatus::Creating),
    ]
}

fn running_machines() -> Vec<(&'static str, NodeRole, MachineStatus)> {
    vec![
        (MASTER, NodeRole::Master, MachineStatus::Running),
        (NODE_1, NodeRole::Worker, MachineStatus::Running),
        (NODE_2, NodeRole::Worker, MachineStatus::Running),
    ]
}

fn full_description(cluster: &orchestrator_shared_types::Cluster) -> infra_provisioner::TfVars {
    description(
        cluster,
        &[
            (MASTER, MachineGroup::Master),
            (NODE_1, MachineGroup::Worker),
            (NODE_2, MachineGroup::Worker),
        ],
    )
}

// ============================================================================
// Kubernetes cluster creation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_k8s_cluster_end_to_end() {
    let h = Harness::new();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &new_cluster_machines()).await;

    let report = h
        .execute(
            "task-create",
            Task::CreateK8sCluster {
                cluster: cluster.clone(),
                description: full_description(&cluster),
                node_ids: node_ids.clone(),
                scale: false,
                limit_hosts: Vec::new(),
            },
        )
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Running);
    assert_eq!(stored.task_id(), Some("task-create"));
    assert_eq!(stored.node_count(), 3);
    assert_eq!(stored.cpu, NODE_SHAPE.cpu * 3);
    assert_eq!(stored.network.network_id.as_deref(), Some("net-mock"));
    assert!(stored.private_key.is_some());
    assert!(stored
        .kube_info
        .kubeconfig
        .as_deref()
        .unwrap()
        .contains("https://203.0.113.20:6443"));
    assert_eq!(stored.kube_info.api_server.as_deref(), Some("https://203.0.113.20:6443"));

    let master = h.node(&node_ids[0]).await.unwrap();
    assert_eq!(master.status, MachineStatus::Running);
    assert_eq!(master.ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(master.floating_ip.as_deref(), Some("203.0.113.20"));

    let records = h.records("task-create").await;
    assert_eq!(
        phases(&records),
        [
            "provision infrastructure",
            "resolve inventory",
            "check connectivity",
            "prepare runtime",
            "deploy etcd",
            "deploy control plane",
            "deploy workers",
            "deploy components",
            "fetch kubeconfig",
        ]
    );
    assert!(records.iter().all(|r| r.state == TaskState::Success));
    for pair in records.windows(2) {
        assert_eq!(pair[0].end_time, Some(pair[1].start_time));
    }

    let requests = h.runner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, PlaybookKind::Cluster);
    assert!(requests[0].limit_hosts.is_empty());
    assert_eq!(h.cloud.token_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_apply_failure_stops_before_configuration() {
    let diagnostic = "Error: creating instance: Quota exceeded for cores";
    let h = Harness::builder()
        .provisioner(MockProvisioner::new().failing_apply(diagnostic))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &new_cluster_machines()).await;

    let report = h
        .execute(
            "task-apply",
            Task::CreateK8sCluster {
                cluster: cluster.clone(),
                description: full_description(&cluster),
                node_ids: node_ids.clone(),
                scale: false,
                limit_hosts: Vec::new(),
            },
        )
        .await;

    match report.outcome {
        TaskOutcome::Failed(OrchestrationError::ProvisionError(msg)) => assert_eq!(msg, diagnostic),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let records = h.records("task-apply").await;
    assert_eq!(phases(&records), ["provision infrastructure"]);
    assert_eq!(records[0].state, TaskState::Failed);
    assert_eq!(records[0].detail, diagnostic);

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Error);
    assert_eq!(stored.status_msg, diagnostic);
    assert!(h.runner.requests().is_empty());
    for id in &node_ids {
        assert_eq!(h.node(id).await.unwrap().status, MachineStatus::Error);
    }
    h.assert_settled(&cluster.id, "task-apply").await;
}

#[tokio::test(start_paused = true)]
async fn test_inventory_failure_closes_resolve_phase() {
    let h = Harness::builder()
        .inventory(MockInventory::failing("terraform.tfstate: no such file"))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &new_cluster_machines()).await;

    let report = h
        .execute(
            "task-inventory",
            Task::CreateK8sCluster {
                cluster: cluster.clone(),
                description: full_description(&cluster),
                node_ids: node_ids.clone(),
                scale: false,
                limit_hosts: Vec::new(),
            },
        )
        .await;
    match &report.outcome {
        TaskOutcome::Failed(OrchestrationError::InventoryError(msg)) => {
            assert!(msg.contains("no such file"), "{msg}")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let records = h.records("task-inventory").await;
    assert_eq!(phases(&records), ["provision infrastructure", "resolve inventory"]);
    assert_eq!(records[0].state, TaskState::Success);
    assert_eq!(records[1].state, TaskState::Failed);
    assert!(records[1].detail.contains("no such file"));

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Error);
    assert!(stored.status_msg.contains("no such file"));
    assert_eq!(h.ping.calls(), 0);
    assert!(h.runner.requests().is_empty());
    for id in &node_ids {
        assert_eq!(h.node(id).await.unwrap().status, MachineStatus::Error);
    }
    h.assert_settled(&cluster.id, "task-inventory").await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_fails_after_six_retries() {
    let h = Harness::builder()
        .ping(MockPing::new().never_reachable([NODE_2]))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &new_cluster_machines()).await;

    let started = tokio::time::Instant::now();
    let report = h
        .execute(
            "task-ping",
            Task::CreateK8sCluster {
                cluster: cluster.clone(),
                description: full_description(&cluster),
                node_ids,
                scale: false,
                limit_hosts: Vec::new(),
            },
        )
        .await;

    match &report.outcome {
        TaskOutcome::Failed(OrchestrationError::ReachabilityError(msg)) => {
            assert!(msg.contains(NODE_2), "{msg}");
            assert!(!msg.contains(NODE_1), "{msg}");
            assert!(msg.contains("6 retries"), "{msg}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.ping.calls(), 7);
    assert!(started.elapsed() <= std::time::Duration::from_secs(35));

    let records = h.records("task-ping").await;
    let last = records.last().unwrap();
    assert_eq!(last.msg, "check connectivity");
    assert_eq!(last.state, TaskState::Failed);
    assert!(last.detail.contains(NODE_2));
    assert!(h.runner.requests().is_empty());

    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Error);
    h.assert_settled(&cluster.id, "task-ping").await;
}

#[tokio::test(start_paused = true)]
async fn test_playbook_failure_records_phase_and_error() {
    let h = Harness::builder()
        .runner(MockRunner::new().failing("kubeadm init: timed out waiting for the condition"))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Creating, &new_cluster_machines()).await;

    let report = h
        .execute(
            "task-playbook",
            Task::CreateK8sCluster {
                cluster: cluster.clone(),
                description: full_description(&cluster),
                node_ids,
                scale: false,
                limit_hosts: Vec::new(),
            },
        )
        .await;
    assert!(matches!(report.outcome, TaskOutcome::Failed(OrchestrationError::RunnerError(_))));

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Error);
    assert_eq!(stored.status_msg, "kubeadm init: timed out waiting for the condition");
    assert!(stored.kube_info.kubeconfig.is_none());
    h.assert_settled(&cluster.id, "task-playbook").await;
}

#[tokio::test(start_paused = true)]
async fn test_scale_out_limits_run_to_new_node() {
    let h = Harness::new();
    let (mut cluster, _) = h
        .seed_cluster(
            ClusterStatus::Running,
            &[
                (MASTER, NodeRole::Master, MachineStatus::Running),
                (NODE_1, NodeRole::Worker, MachineStatus::Running),
            ],
        )
        .await;
    cluster.kube_info.kubeconfig = Some("existing kubeconfig".into());
    cluster.bump_node_count(2);
    h.store_cluster(&cluster).await;
    h.provisioner.with_workdir(
        cluster.id,
        description(&cluster, &[(MASTER, MachineGroup::Master), (NODE_1, MachineGroup::Worker)]),
    );
    let new_ids = h
        .seed_nodes(&cluster, &[(NODE_2, NodeRole::Worker, MachineStatus::Creating)])
        .await;

    let report = h
        .execute(
            "task-scale",
            Task::CreateK8sCluster {
                cluster: cluster.clone(),
                description: description(&cluster, &[(NODE_2, MachineGroup::Worker)]),
                node_ids: new_ids.clone(),
                scale: true,
                limit_hosts: Vec::new(),
            },
        )
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Running);
    assert_eq!(stored.node_count(), 3);
    assert_eq!(stored.kube_info.kubeconfig.as_deref(), Some("existing kubeconfig"));
    assert_eq!(h.node(&new_ids[0]).await.unwrap().status, MachineStatus::Running);

    let desc = h.provisioner.description(&cluster.id).unwrap();
    assert_eq!(desc.nodes.len(), 3);
    assert!(h.provisioner.calls().contains(&ProvisionerCall::Provision {
        cluster_id: cluster.id,
        scale_out: true,
    }));

    let requests = h.runner.requests();
    assert_eq!(requests[0].kind, PlaybookKind::Scale);
    assert_eq!(requests[0].limit_hosts, vec![NODE_2.to_string()]);
    assert!(!phases(&h.records("task-scale").await).contains(&"fetch kubeconfig"));
}

// ============================================================================
// Teardown and node removal
// ============================================================================

#[tokio::test]
async fn test_delete_cluster_tolerates_security_group_in_use() {
    let h = Harness::builder()
        .provisioner(MockProvisioner::new().destroy_with_note("SecurityGroupInUse: sg-web still attached"))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Running, &running_machines()).await;
    h.provisioner.with_workdir(cluster.id, full_description(&cluster));

    let report = h
        .execute("task-delete", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Deleted);
    assert!(stored.status_msg.contains("SecurityGroupInUse"));
    for id in &node_ids {
        assert!(h.node(id).await.is_none());
    }

    let records = h.records("task-delete").await;
    assert_eq!(phases(&records), ["destroy infrastructure"]);
    assert_eq!(records[0].state, TaskState::Success);

    let calls = h.provisioner.calls();
    assert!(calls.contains(&ProvisionerCall::Destroy(cluster.id)));
    assert!(calls.contains(&ProvisionerCall::Retire(cluster.id)));
    assert_eq!(h.cloud.token_requests(), 1);
    assert!(!h.provisioner.workdir_exists(&cluster.id));
}

#[tokio::test]
async fn test_delete_cluster_failure_sets_delete_error() {
    let h = Harness::builder()
        .provisioner(MockProvisioner::new().failing_destroy("Error: deleting router interface: 409"))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Running, &running_machines()).await;
    h.provisioner.with_workdir(cluster.id, full_description(&cluster));

    let report = h
        .execute("task-delete", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    assert!(!report.is_success());

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::DeleteError);
    assert_eq!(stored.status_msg, "Error: deleting router interface: 409");
    assert!(h.node(&node_ids[0]).await.is_some());
    h.assert_settled(&cluster.id, "task-delete").await;
}

#[tokio::test]
async fn test_delete_cluster_without_workdir_is_idempotent() {
    let h = Harness::new();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Error, &running_machines()).await;

    let first = h
        .execute("task-delete-1", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    assert!(first.is_success(), "{:?}", first.outcome);
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Deleted);
    assert!(h.node(&node_ids[1]).await.is_none());
    assert!(!h
        .provisioner
        .calls()
        .iter()
        .any(|c| matches!(c, ProvisionerCall::Destroy(_))));

    let second = h
        .execute("task-delete-2", Task::DeleteCluster { cluster_id: cluster.id })
        .await;
    assert!(second.is_success());
    assert!(h.records("task-delete-2").await.is_empty());
}

#[tokio::test]
async fn test_delete_node_then_repeat_is_noop() {
    let h = Harness::new();
    let (mut cluster, node_ids) = h.seed_cluster(ClusterStatus::Running, &running_machines()).await;
    cluster.add_resources(&NODE_SHAPE);
    cluster.add_resources(&NODE_SHAPE);
    cluster.add_resources(&NODE_SHAPE);
    h.store_cluster(&cluster).await;
    h.provisioner.with_workdir(cluster.id, full_description(&cluster));
    let removed = vec![node_ids[2]];

    let report = h
        .execute(
            "task-remove",
            Task::DeleteNode {
                cluster_id: cluster.id,
                node_ids: removed.clone(),
            },
        )
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Running);
    assert_eq!(stored.cpu, NODE_SHAPE.cpu * 2);
    assert!(h.node(&node_ids[2]).await.is_none());
    assert!(h.node(&node_ids[1]).await.is_some());

    let desc = h.provisioner.description(&cluster.id).unwrap();
    assert!(!desc.nodes.contains_key(NODE_2));
    assert!(desc.nodes.contains_key(NODE_1));

    let requests = h.runner.requests();
    assert_eq!(requests[0].kind, PlaybookKind::RemoveNode);
    assert_eq!(requests[0].extra_vars["node"], NODE_2);
    assert_eq!(
        phases(&h.records("task-remove").await),
        ["remove from cluster", "release infrastructure"]
    );

    let calls_before = h.provisioner.calls().len();
    let again = h
        .execute(
            "task-remove-again",
            Task::DeleteNode {
                cluster_id: cluster.id,
                node_ids: removed,
            },
        )
        .await;
    assert!(again.is_success());
    assert_eq!(h.provisioner.calls().len(), calls_before);
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Running);
    assert_eq!(h.runner.requests().len(), 1);
}

#[tokio::test]
async fn test_delete_node_playbook_failure_sets_remove_error() {
    let h = Harness::builder()
        .runner(MockRunner::new().failing("drain timed out"))
        .build();
    let (cluster, node_ids) = h.seed_cluster(ClusterStatus::Running, &running_machines()).await;
    h.provisioner.with_workdir(cluster.id, full_description(&cluster));

    let report = h
        .execute(
            "task-remove",
            Task::DeleteNode {
                cluster_id: cluster.id,
                node_ids: vec![node_ids[1]],
            },
        )
        .await;
    assert!(!report.is_success());

    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::RemoveError);
    assert_eq!(h.node(&node_ids[1]).await.unwrap().status, MachineStatus::Error);
    assert!(h.provisioner.calls().is_empty());
    h.assert_settled(&cluster.id, "task-remove").await;
}

// ============================================================================
// Bare-metal pools
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_baremetal_pool_create_and_shrink() {
    let h = Harness::new();
    let cluster = orchestrator_shared_types::Cluster::new(CLUSTER, ClusterStatus::Creating);
    h.store_cluster(&cluster).await;
    let ids = h.seed_instances(&cluster, &[MASTER, NODE_1]).await;

    let report = h
        .execute(
            "task-pool",
            Task::CreateCluster {
                cluster: cluster.clone(),
                description: description(
                    &cluster,
                    &[(MASTER, MachineGroup::Baremetal), (NODE_1, MachineGroup::Baremetal)],
                ),
                instance_ids: ids.clone(),
            },
        )
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);

    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Running);
    assert_eq!(stored.cpu, NODE_SHAPE.cpu * 2);
    let first = h.instance(&ids[0]).await.unwrap();
    assert_eq!(first.status, MachineStatus::Running);
    assert_eq!(first.ip.as_deref(), Some("10.0.0.5"));
    assert!(h.runner.requests().is_empty());
    assert_eq!(
        phases(&h.records("task-pool").await),
        ["provision infrastructure", "resolve inventory", "check connectivity"]
    );

    let report = h
        .execute(
            "task-shrink",
            Task::DeleteBaremetal {
                cluster_id: cluster.id,
                instance_ids: vec![ids[1]],
            },
        )
        .await;
    assert!(report.is_success(), "{:?}", report.outcome);
    assert!(h.instance(&ids[1]).await.is_none());
    let stored = h.cluster(&cluster.id).await;
    assert_eq!(stored.status, ClusterStatus::Running);
    assert_eq!(stored.cpu, NODE_SHAPE.cpu);
    assert_eq!(h.provisioner.description(&cluster.id).unwrap().nodes.len(), 1);
    assert_eq!(phases(&h.records("task-shrink").await), ["release infrastructure"]);
}
