//! Shared harness: a worker pool wired to mock collaborators and an
//! in-memory store.

#![allow(dead_code)]

use std::sync::Arc;

use cloud_api::{CloudClients, MockCloud};
use config_runner::{MockPing, MockRunner};
use engine_config::EngineConfig;
use infra_provisioner::{MachineGroup, MachineSpec, MockInventory, MockProvisioner, TfVars};
use orchestrator_core::{Task, TaskMessage, TaskReport, WorkerPool, WorkflowContext};
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterStatus, Instance, InstanceId, MachineStatus, Node, NodeId, NodeRole,
    Resources, TaskState, Taskinfo,
};
use state_store_interface::in_memory::InMemoryStateStore;
use state_store_interface::StateStore;
use tempfile::TempDir;

pub const CLUSTER: &str = "c1";

pub const NODE_SHAPE: Resources = Resources {
    cpu: 4,
    mem: 8192,
    gpu: 0,
    disk: 40,
};

pub struct Harness {
    pub store: Arc<InMemoryStateStore>,
    pub provisioner: Arc<MockProvisioner>,
    pub runner: Arc<MockRunner>,
    pub ping: Arc<MockPing>,
    pub cloud: Arc<MockCloud>,
    pub pool: WorkerPool,
    _root: TempDir,
}

pub struct HarnessBuilder {
    provisioner: MockProvisioner,
    runner: MockRunner,
    ping: MockPing,
    inventory: MockInventory,
    cloud: MockCloud,
    config: EngineConfig,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        let mut config = EngineConfig::default();
        config.reachability.max_wait_secs = 30;
        config.reachability.interval_secs = 5;
        HarnessBuilder {
            provisioner: MockProvisioner::new(),
            runner: MockRunner::new(),
            ping: MockPing::new(),
            inventory: MockInventory::simple(CLUSTER, 2),
            cloud: MockCloud::new(),
            config,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn execute(&self, task_id: &str, task: Task) -> TaskReport {
        self.pool.execute(TaskMessage::new(task_id, task)).await
    }

    pub async fn cluster(&self, id: &ClusterId) -> Cluster {
        self.store.get_cluster(id).await.unwrap().expect("cluster row")
    }

    pub async fn node(&self, id: &NodeId) -> Option<Node> {
        self.store.get_node(id).await.unwrap()
    }

    pub async fn instance(&self, id: &InstanceId) -> Option<Instance> {
        self.store.get_instance(id).await.unwrap()
    }

    pub async fn records(&self, task_id: &str) -> Vec<Taskinfo> {
        self.store.list_taskinfos(task_id).await.unwrap()
    }

    /// Insert a cluster in `status` with one row per `(name, role)`.
    pub async fn seed_cluster(
        &self,
        status: ClusterStatus,
        nodes: &[(&str, NodeRole, MachineStatus)],
    ) -> (Cluster, Vec<NodeId>) {
        let cluster = Cluster::new(CLUSTER, status);
        self.store.put_cluster(cluster.clone()).await.unwrap();
        let ids = self.seed_nodes(&cluster, nodes).await;
        (cluster, ids)
    }

    pub async fn seed_nodes(&self, cluster: &Cluster, nodes: &[(&str, NodeRole, MachineStatus)]) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for (name, role, status) in nodes {
            let mut node = Node::new(cluster.id, *name, *role);
            node.status = *status;
            node.resources = NODE_SHAPE;
            ids.push(node.id);
            self.store.put_node(node).await.unwrap();
        }
        ids
    }

    pub async fn store_cluster(&self, cluster: &Cluster) {
        self.store.put_cluster(cluster.clone()).await.unwrap();
    }

    pub async fn seed_instances(&self, cluster: &Cluster, names: &[&str]) -> Vec<InstanceId> {
        let mut ids = Vec::new();
        for name in names {
            let mut instance = Instance::new(cluster.id, *name);
            instance.resources = NODE_SHAPE;
            instance.flavor = Some("m1.large".into());
            instance.image = Some("ubuntu-22.04".into());
            ids.push(instance.id);
            self.store.put_instance(instance).await.unwrap();
        }
        ids
    }

    /// Neither the cluster nor any of its machines is left transient, and no
    /// progress record of `task_id` is still open.
    pub async fn assert_settled(&self, cluster_id: &ClusterId, task_id: &str) {
        let cluster = self.cluster(cluster_id).await;
        assert!(!cluster.status.is_transient(), "cluster left {}", cluster.status);
        for node in self.store.list_nodes_for_cluster(cluster_id).await.unwrap() {
            assert!(!node.status.is_transient(), "node {} left {}", node.name, node.status);
        }
        for instance in self.store.list_instances_for_cluster(cluster_id).await.unwrap() {
            assert!(
                !instance.status.is_transient(),
                "instance {} left {}",
                instance.name,
                instance.status
            );
        }
        let records = self.records(task_id).await;
        assert!(records.iter().all(|r| r.state != TaskState::Progress), "open record left: {records:?}");
    }
}

impl HarnessBuilder {
    pub fn provisioner(mut self, provisioner: MockProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn runner(mut self, runner: MockRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn ping(mut self, ping: MockPing) -> Self {
        self.ping = ping;
        self
    }

    pub fn inventory(mut self, inventory: MockInventory) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn cloud(mut self, cloud: MockCloud) -> Self {
        self.cloud = cloud;
        self
    }

    pub fn configure(mut self, edit: impl FnOnce(&mut EngineConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn build(self) -> Harness {
        let root = TempDir::new().unwrap();
        let mut config = self.config;
        config.paths.clusters_root = root.path().join("clusters");

        let store = Arc::new(InMemoryStateStore::new());
        let provisioner = Arc::new(self.provisioner);
        let runner = Arc::new(self.runner);
        let ping = Arc::new(self.ping);
        let cloud = Arc::new(self.cloud);

        let ctx = WorkflowContext::new(
            store.clone(),
            provisioner.clone(),
            Arc::new(self.inventory),
            runner.clone(),
            ping.clone(),
            CloudClients::from_shared(cloud.clone()),
            Arc::new(config),
        );
        Harness {
            store,
            provisioner,
            runner,
            ping,
            cloud,
            pool: WorkerPool::new(Arc::new(ctx)),
            _root: root,
        }
    }
}

pub fn machine(group: MachineGroup) -> MachineSpec {
    MachineSpec {
        group,
        flavor: "m1.large".into(),
        image: "ubuntu-22.04".into(),
        availability_zone: None,
        floating_ip: group == MachineGroup::Master,
        use_local_disk: false,
        volume_size: None,
        volume_type: None,
        port_forwards: Vec::new(),
        resources: NODE_SHAPE,
        extra: Default::default(),
    }
}

pub fn description(cluster: &Cluster, machines: &[(&str, MachineGroup)]) -> TfVars {
    let mut desc = TfVars::new(&cluster.name, cluster.id);
    for (name, group) in machines {
        desc.nodes.insert(name.to_string(), machine(*group));
    }
    desc
}

pub fn phases(records: &[Taskinfo]) -> Vec<&str> {
    records.iter().map(|r| r.msg.as_str()).collect()
}
