use async_trait::async_trait;
use orchestrator_shared_types::{
    Cluster, ClusterId, Instance, InstanceId, Node, NodeId, OrchestrationError, Result, Taskinfo,
};
use std::sync::Arc;
use thiserror::Error;

pub mod progress;

pub use progress::ProgressTracker;

/// Errors specific to state store operations
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<StateStoreError> for OrchestrationError {
    fn from(err: StateStoreError) -> Self {
        OrchestrationError::StateError(err.to_string())
    }
}

/// Relational store beneath the workflows.
///
/// Every method is one short mutation or query; implementations must not hold
/// locks or transactions across calls, since workflows interleave store
/// updates with external processes that run for many minutes.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ===== Initialization =====

    /// Create schema / open connections.
    async fn initialize(&self) -> Result<()>;

    /// Check if the state store is healthy
    async fn health_check(&self) -> Result<bool>;

    // ===== Cluster Operations =====

    /// Store or update a cluster row.
    async fn put_cluster(&self, cluster: Cluster) -> Result<()>;

    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>>;

    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    // ===== Node Operations =====

    async fn put_node(&self, node: Node) -> Result<()>;

    async fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>>;

    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Node>>;

    async fn delete_node(&self, node_id: &NodeId) -> Result<()>;

    /// Delete every node of a cluster (cascade on cluster deletion).
    async fn delete_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        for node in self.list_nodes_for_cluster(cluster_id).await? {
            self.delete_node(&node.id).await?;
        }
        Ok(())
    }

    // ===== Instance Operations =====

    async fn put_instance(&self, instance: Instance) -> Result<()>;

    async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<Instance>>;

    async fn list_instances_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Instance>>;

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()>;

    async fn delete_instances_for_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        for instance in self.list_instances_for_cluster(cluster_id).await? {
            self.delete_instance(&instance.id).await?;
        }
        Ok(())
    }

    // ===== Progress Records =====

    /// Insert the record, or update the existing one with the same `(task_id, msg)` in place.
    async fn upsert_taskinfo(&self, info: Taskinfo) -> Result<()>;

    async fn get_taskinfo(&self, task_id: &str, msg: &str) -> Result<Option<Taskinfo>>;

    /// All records of one task ordered by `start_time`.
    async fn list_taskinfos(&self, task_id: &str) -> Result<Vec<Taskinfo>>;
}

// Re-export implementations based on features
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(feature = "in-memory")]
pub mod in_memory;

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStateStore;

/// Configuration for state store backends
#[derive(Debug, Clone)]
pub enum StateStoreConfig {
    /// SQLite backend (default)
    #[cfg(feature = "sqlite")]
    Sqlite {
        /// Path to the SQLite database file
        path: std::path::PathBuf,
    },

    #[cfg(feature = "in-memory")]
    InMemory,
}

/// Open the configured backend and make sure its schema exists.
pub async fn create_state_store(config: StateStoreConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config {
        #[cfg(feature = "sqlite")]
        StateStoreConfig::Sqlite { path } => Arc::new(sqlite_store::SqliteStateStore::open(path)?),

        #[cfg(feature = "in-memory")]
        StateStoreConfig::InMemory => Arc::new(in_memory::InMemoryStateStore::new()),
    };
    store.initialize().await?;
    Ok(store)
}
