use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod retry;

pub type ClusterId = Uuid;
pub type NodeId = Uuid;
pub type InstanceId = Uuid;
pub type TaskId = String; // Assigned by the task queue at submission time

/// Key in `Cluster::extra` holding the id of the task currently operating on the cluster.
pub const EXTRA_TASK_ID: &str = "task_id";
/// Key in `Cluster::extra` holding the cumulative number of nodes ever added.
pub const EXTRA_NODE_COUNT: &str = "node_count";

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(ClusterId),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),
    #[error("Provisioning failed: {0}")]
    ProvisionError(String),
    #[error("Inventory error: {0}")]
    InventoryError(String),
    #[error("Hosts unreachable: {0}")]
    ReachabilityError(String),
    #[error("Configuration run failed: {0}")]
    RunnerError(String),
    #[error("Cloud API error: {0}")]
    CloudApiError(String),
    #[error("State persistence error: {0}")]
    StateError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Invalid task message: {0}")]
    InvalidMessage(String),
    #[error("Task exceeded its soft time limit")]
    SoftTimeLimitExceeded,
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Error returned when a status string read back from storage is not part of the vocabulary.
#[derive(Debug, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }
    };
}

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Creating,
    Running,
    Scaling,
    Removing,
    Deleting,
    Deleted,
    Error,
    ScaleError,
    DeleteError,
    RemoveError,
}

string_enum!(ClusterStatus {
    Creating => "creating",
    Running => "running",
    Scaling => "scaling",
    Removing => "removing",
    Deleting => "deleting",
    Deleted => "deleted",
    Error => "error",
    ScaleError => "scale_error",
    DeleteError => "delete_error",
    RemoveError => "remove_error",
});

impl ClusterStatus {
    /// Transient states are owned by a running workflow and must never outlive it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Creating
                | ClusterStatus::Scaling
                | ClusterStatus::Removing
                | ClusterStatus::Deleting
        )
    }
}

/// Lifecycle state of a node or instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Creating,
    Running,
    Deleting,
    Error,
}

string_enum!(MachineStatus {
    Creating => "creating",
    Running => "running",
    Deleting => "deleting",
    Error => "error",
});

impl MachineStatus {
    pub fn is_transient(&self) -> bool {
        matches!(self, MachineStatus::Creating | MachineStatus::Deleting)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker,
}

string_enum!(NodeRole {
    Master => "master",
    Worker => "worker",
});

/// State of a single progress record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Progress,
    Success,
    Failed,
}

string_enum!(TaskState {
    Progress => "progress",
    Success => "success",
    Failed => "failed",
});

/// Fixed vocabulary of workflow phases. The text form is what lands in `Taskinfo::msg`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ProvisionInfrastructure,
    ResolveInventory,
    CheckConnectivity,
    PrepareRuntime,
    DeployEtcd,
    DeployControlPlane,
    DeployWorkers,
    DeployComponents,
    FetchKubeconfig,
    RemoveFromCluster,
    ReleaseInfrastructure,
    DestroyInfrastructure,
    CreateServer,
    DeleteServer,
}

string_enum!(Phase {
    ProvisionInfrastructure => "provision infrastructure",
    ResolveInventory => "resolve inventory",
    CheckConnectivity => "check connectivity",
    PrepareRuntime => "prepare runtime",
    DeployEtcd => "deploy etcd",
    DeployControlPlane => "deploy control plane",
    DeployWorkers => "deploy workers",
    DeployComponents => "deploy components",
    FetchKubeconfig => "fetch kubeconfig",
    RemoveFromCluster => "remove from cluster",
    ReleaseInfrastructure => "release infrastructure",
    DestroyInfrastructure => "destroy infrastructure",
    CreateServer => "create server",
    DeleteServer => "delete server",
});

/// Resource shape of a machine, or an aggregate over several.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Resources {
    pub cpu: u32,
    pub mem: u64, // MiB
    pub gpu: u32,
    pub disk: u64, // GiB
}

impl Resources {
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Resources>) -> Resources {
        items.into_iter().fold(Resources::default(), |acc, r| Resources {
            cpu: acc.cpu + r.cpu,
            mem: acc.mem + r.mem,
            gpu: acc.gpu + r.gpu,
            disk: acc.disk + r.disk,
        })
    }
}

/// Network objects discovered or created while provisioning a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterNetwork {
    pub network_id: Option<String>,
    pub subnet_id: Option<String>,
    pub router_id: Option<String>,
    pub bastion_ip: Option<String>,
}

/// Kubernetes-specific information, serialized as one blob on the cluster row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KubeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub status: ClusterStatus,
    #[serde(default)]
    pub status_msg: String,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default)]
    pub kube_info: KubeInfo,
    #[serde(default)]
    pub network: ClusterNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, status: ClusterStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status,
            status_msg: String::new(),
            cpu: 0,
            mem: 0,
            gpu: 0,
            kube_info: KubeInfo::default(),
            network: ClusterNetwork::default(),
            private_key: None,
            extra: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: ClusterStatus, msg: impl Into<String>) {
        self.status = status;
        self.status_msg = msg.into();
        self.updated_at = Utc::now();
    }

    pub fn task_id(&self) -> Option<&str> {
        self.extra.get(EXTRA_TASK_ID).and_then(Value::as_str)
    }

    pub fn set_task_id(&mut self, task_id: &str) {
        self.extra
            .insert(EXTRA_TASK_ID.to_string(), Value::String(task_id.to_string()));
    }

    pub fn node_count(&self) -> u64 {
        self.extra
            .get(EXTRA_NODE_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// The counter only ever grows; it seeds names for future nodes.
    pub fn bump_node_count(&mut self, added: u64) {
        let total = self.node_count() + added;
        self.extra
            .insert(EXTRA_NODE_COUNT.to_string(), Value::from(total));
    }

    pub fn add_resources(&mut self, r: &Resources) {
        self.cpu = self.cpu.saturating_add(r.cpu);
        self.mem = self.mem.saturating_add(r.mem);
        self.gpu = self.gpu.saturating_add(r.gpu);
    }

    pub fn sub_resources(&mut self, r: &Resources) {
        self.cpu = self.cpu.saturating_sub(r.cpu);
        self.mem = self.mem.saturating_sub(r.mem);
        self.gpu = self.gpu.saturating_sub(r.gpu);
    }
}

/// A Kubernetes cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub role: NodeRole,
    pub status: MachineStatus,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub floating_ip: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

impl Node {
    pub fn new(cluster_id: ClusterId, name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            name: name.into(),
            role,
            status: MachineStatus::Creating,
            server_id: None,
            ip: None,
            floating_ip: None,
            resources: Resources::default(),
        }
    }
}

/// Port-forwarding rule on the cluster's bastion floating IP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub internal_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Assigned when the rule is allocated.
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default)]
    pub rule_id: Option<String>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// A bare machine in a bare-metal pool, or a standalone server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub status: MachineStatus,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub floating_ip: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
}

impl Instance {
    pub fn new(cluster_id: ClusterId, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            name: name.into(),
            status: MachineStatus::Creating,
            server_id: None,
            ip: None,
            floating_ip: None,
            flavor: None,
            image: None,
            availability_zone: None,
            resources: Resources::default(),
            port_forwards: Vec::new(),
        }
    }
}

/// One durable progress record: start, end and outcome of a single workflow phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Taskinfo {
    pub task_id: TaskId,
    pub cluster_id: ClusterId,
    pub msg: String,
    pub state: TaskState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detail: String,
}

impl Taskinfo {
    pub fn open(task_id: &str, cluster_id: ClusterId, phase: Phase, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_string(),
            cluster_id,
            msg: phase.as_str().to_string(),
            state: TaskState::Progress,
            start_time: at,
            end_time: None,
            detail: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TaskState::Progress
    }
}

// Generic result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_status_round_trip_text() {
        for status in [
            ClusterStatus::Creating,
            ClusterStatus::ScaleError,
            ClusterStatus::RemoveError,
            ClusterStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<ClusterStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<ClusterStatus>().is_err());
    }

    #[test]
    fn test_transient_states() {
        assert!(ClusterStatus::Creating.is_transient());
        assert!(ClusterStatus::Deleting.is_transient());
        assert!(!ClusterStatus::DeleteError.is_transient());
        assert!(!ClusterStatus::Running.is_transient());
        assert!(MachineStatus::Deleting.is_transient());
        assert!(!MachineStatus::Error.is_transient());
    }

    #[test]
    fn test_phase_text_matches_vocabulary() {
        assert_eq!(Phase::ProvisionInfrastructure.to_string(), "provision infrastructure");
        assert_eq!(Phase::DeployControlPlane.as_str(), "deploy control plane");
        assert_eq!("remove from cluster".parse::<Phase>().unwrap(), Phase::RemoveFromCluster);
    }

    #[test]
    fn test_cluster_extra_counters() {
        let mut cluster = Cluster::new("demo", ClusterStatus::Creating);
        assert_eq!(cluster.node_count(), 0);
        assert!(cluster.task_id().is_none());

        cluster.set_task_id("task-1");
        cluster.bump_node_count(3);
        cluster.bump_node_count(2);

        assert_eq!(cluster.task_id(), Some("task-1"));
        assert_eq!(cluster.node_count(), 5);
    }

    #[test]
    fn test_resource_arithmetic_saturates() {
        let mut cluster = Cluster::new("demo", ClusterStatus::Running);
        let shape = Resources { cpu: 4, mem: 8192, gpu: 1, disk: 40 };
        cluster.add_resources(&shape);
        cluster.add_resources(&shape);
        assert_eq!((cluster.cpu, cluster.mem, cluster.gpu), (8, 16384, 2));

        cluster.sub_resources(&Resources { cpu: 100, mem: 1, gpu: 0, disk: 0 });
        assert_eq!(cluster.cpu, 0);
        assert_eq!(cluster.mem, 16383);
    }

    #[test]
    fn test_resources_sum() {
        let items = [
            Resources { cpu: 2, mem: 1024, gpu: 0, disk: 20 },
            Resources { cpu: 4, mem: 2048, gpu: 1, disk: 40 },
        ];
        let total = Resources::sum(&items);
        assert_eq!(total, Resources { cpu: 6, mem: 3072, gpu: 1, disk: 60 });
    }

    #[test]
    fn test_cluster_serde_defaults() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "legacy",
            "status": "scale_error",
            "created_at": "2024-01-15T10:30:00Z",
            "updated_at": "2024-01-15T10:30:00Z"
        });
        let cluster: Cluster = serde_json::from_value(json).unwrap();
        assert_eq!(cluster.status, ClusterStatus::ScaleError);
        assert!(cluster.kube_info.kubeconfig.is_none());
        assert_eq!(cluster.node_count(), 0);
    }
}
