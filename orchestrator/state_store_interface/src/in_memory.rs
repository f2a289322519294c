use async_trait::async_trait;
use orchestrator_shared_types::{
    Cluster, ClusterId, Instance, InstanceId, Node, NodeId, Result, Taskinfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::StateStore;

/// In-memory implementation of StateStore
///
/// RwLock-protected maps; suitable for tests and single-process development
/// where persistence across restarts is not required.
#[derive(Default)]
pub struct InMemoryStateStore {
    clusters: Arc<RwLock<HashMap<ClusterId, Cluster>>>,
    nodes: Arc<RwLock<HashMap<NodeId, Node>>>,
    instances: Arc<RwLock<HashMap<InstanceId, Instance>>>,
    taskinfos: Arc<RwLock<Vec<Taskinfo>>>, // Insertion order; keyed by (task_id, msg)
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn put_cluster(&self, cluster: Cluster) -> Result<()> {
        self.clusters.write().await.insert(cluster.id, cluster);
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        Ok(self.clusters.read().await.get(cluster_id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.read().await.values().cloned().collect())
    }

    async fn put_node(&self, node: Node) -> Result<()> {
        self.nodes.write().await.insert(node.id, node);
        Ok(())
    }

    async fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>> {
        Ok(self.nodes.read().await.get(node_id).cloned())
    }

    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Node>> {
        let nodes = self.nodes.read().await;
        let mut found: Vec<Node> = nodes
            .values()
            .filter(|n| &n.cluster_id == cluster_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn delete_node(&self, node_id: &NodeId) -> Result<()> {
        self.nodes.write().await.remove(node_id);
        Ok(())
    }

    async fn put_instance(&self, instance: Instance) -> Result<()> {
        self.instances.write().await.insert(instance.id, instance);
        Ok(())
    }

    async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(instance_id).cloned())
    }

    async fn list_instances_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Instance>> {
        let instances = self.instances.read().await;
        let mut found: Vec<Instance> = instances
            .values()
            .filter(|i| &i.cluster_id == cluster_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        self.instances.write().await.remove(instance_id);
        Ok(())
    }

    async fn upsert_taskinfo(&self, info: Taskinfo) -> Result<()> {
        let mut infos = self.taskinfos.write().await;
        match infos
            .iter_mut()
            .find(|t| t.task_id == info.task_id && t.msg == info.msg)
        {
            Some(existing) => *existing = info,
            None => infos.push(info),
        }
        Ok(())
    }

    async fn get_taskinfo(&self, task_id: &str, msg: &str) -> Result<Option<Taskinfo>> {
        let infos = self.taskinfos.read().await;
        Ok(infos
            .iter()
            .find(|t| t.task_id == task_id && t.msg == msg)
            .cloned())
    }

    async fn list_taskinfos(&self, task_id: &str) -> Result<Vec<Taskinfo>> {
        let infos = self.taskinfos.read().await;
        let mut found: Vec<Taskinfo> = infos
            .iter()
            .filter(|t| t.task_id == task_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal start times
        found.sort_by_key(|t| t.start_time);
        Ok(found)
    }
}
