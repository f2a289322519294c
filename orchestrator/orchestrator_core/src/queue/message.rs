//! Typed, versioned task messages.
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "task_id": "6f1c...",
//!   "task": { "name": "delete_node", "args": { "cluster_id": "...", "node_ids": ["..."] } }
//! }
//! ```

use infra_provisioner::TfVars;
use orchestrator_shared_types::{Cluster, ClusterId, ClusterStatus, InstanceId, NodeId, TaskId};
use serde::{Deserialize, Serialize};

use super::QueueError;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub schema_version: u32,
    pub task_id: TaskId,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum Task {
    /// Bare-metal pool: provision, resolve, probe, record the instances.
    CreateCluster {
        cluster: Cluster,
        description: TfVars,
        instance_ids: Vec<InstanceId>,
    },
    /// Kubernetes cluster creation, or scale-out of an existing one.
    CreateK8sCluster {
        cluster: Cluster,
        description: TfVars,
        node_ids: Vec<NodeId>,
        #[serde(default)]
        scale: bool,
        /// Hosts the configuration run is limited to; defaults to the new machines.
        #[serde(default)]
        limit_hosts: Vec<String>,
    },
    DeleteCluster {
        cluster_id: ClusterId,
    },
    DeleteNode {
        cluster_id: ClusterId,
        node_ids: Vec<NodeId>,
    },
    DeleteBaremetal {
        cluster_id: ClusterId,
        instance_ids: Vec<InstanceId>,
    },
    CreateInstance {
        cluster_id: ClusterId,
        instance_id: InstanceId,
    },
    DeleteInstance {
        cluster_id: ClusterId,
        instance_id: InstanceId,
    },
}

impl Task {
    /// Wire name, also the key for per-task time limits.
    pub fn name(&self) -> &'static str {
        match self {
            Task::CreateCluster { .. } => "create_cluster",
            Task::CreateK8sCluster { .. } => "create_k8s_cluster",
            Task::DeleteCluster { .. } => "delete_cluster",
            Task::DeleteNode { .. } => "delete_node",
            Task::DeleteBaremetal { .. } => "delete_baremetal",
            Task::CreateInstance { .. } => "create_instance",
            Task::DeleteInstance { .. } => "delete_instance",
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        match self {
            Task::CreateCluster { cluster, .. } | Task::CreateK8sCluster { cluster, .. } => cluster.id,
            Task::DeleteCluster { cluster_id }
            | Task::DeleteNode { cluster_id, .. }
            | Task::DeleteBaremetal { cluster_id, .. }
            | Task::CreateInstance { cluster_id, .. }
            | Task::DeleteInstance { cluster_id, .. } => *cluster_id,
        }
    }

    /// Cluster status written when this task fails; `None` for tasks that
    /// only touch a single instance.
    pub fn failure_status(&self) -> Option<ClusterStatus> {
        match self {
            Task::CreateCluster { .. } => Some(ClusterStatus::Error),
            Task::CreateK8sCluster { scale: false, .. } => Some(ClusterStatus::Error),
            Task::CreateK8sCluster { scale: true, .. } => Some(ClusterStatus::ScaleError),
            Task::DeleteCluster { .. } => Some(ClusterStatus::DeleteError),
            Task::DeleteNode { .. } | Task::DeleteBaremetal { .. } => Some(ClusterStatus::RemoveError),
            Task::CreateInstance { .. } | Task::DeleteInstance { .. } => None,
        }
    }

    pub fn node_ids(&self) -> &[NodeId] {
        match self {
            Task::CreateK8sCluster { node_ids, .. } | Task::DeleteNode { node_ids, .. } => node_ids.as_slice(),
            _ => &[],
        }
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        match self {
            Task::CreateCluster { instance_ids, .. } | Task::DeleteBaremetal { instance_ids, .. } => {
                instance_ids.clone()
            }
            Task::CreateInstance { instance_id, .. } | Task::DeleteInstance { instance_id, .. } => {
                vec![*instance_id]
            }
            _ => Vec::new(),
        }
    }
}

impl TaskMessage {
    pub fn new(task_id: impl Into<TaskId>, task: Task) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: task_id.into(),
            task,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        let msg: TaskMessage = serde_json::from_str(raw)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Checks applied at the queue boundary before a message is accepted.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(QueueError::UnsupportedVersion {
                found: self.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        if self.task_id.trim().is_empty() {
            return Err(QueueError::invalid("task_id must not be empty"));
        }

        match &self.task {
            Task::CreateCluster {
                cluster,
                description,
                instance_ids,
            } => {
                check_description(cluster, description)?;
                non_empty("instance_ids", instance_ids)
            }
            Task::CreateK8sCluster {
                cluster,
                description,
                node_ids,
                ..
            } => {
                check_description(cluster, description)?;
                non_empty("node_ids", node_ids)
            }
            Task::DeleteNode { node_ids, .. } => non_empty("node_ids", node_ids),
            Task::DeleteBaremetal { instance_ids, .. } => non_empty("instance_ids", instance_ids),
            Task::DeleteCluster { .. } | Task::CreateInstance { .. } | Task::DeleteInstance { .. } => Ok(()),
        }
    }
}

fn check_description(cluster: &Cluster, description: &TfVars) -> Result<(), QueueError> {
    if cluster.name.trim().is_empty() {
        return Err(QueueError::invalid("cluster name must not be empty"));
    }
    if description.cluster_id != cluster.id {
        return Err(QueueError::invalid(format!(
            "description belongs to cluster {}, message is for {}",
            description.cluster_id, cluster.id
        )));
    }
    Ok(())
}

fn non_empty<T>(field: &str, ids: &[T]) -> Result<(), QueueError> {
    if ids.is_empty() {
        return Err(QueueError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}
