//! Task queue boundary: message validation, admission and the worker pool.

mod message;
mod worker;

pub use message::{Task, TaskMessage, SCHEMA_VERSION};
pub use worker::{TaskOutcome, TaskReport, WorkerPool};

use orchestrator_shared_types::{ClusterId, OrchestrationError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Malformed task message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Invalid task message: {0}")]
    InvalidMessage(String),

    #[error("Cluster {cluster_id} is {status} under task {owner}")]
    ClusterBusy {
        cluster_id: ClusterId,
        status: String,
        owner: String,
    },

    #[error("A task for cluster {0} is already running")]
    AlreadyRunning(ClusterId),

    #[error("Worker pool is shut down")]
    Closed,

    #[error("State lookup failed: {0}")]
    State(String),
}

impl QueueError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        QueueError::InvalidMessage(msg.into())
    }
}

impl From<OrchestrationError> for QueueError {
    fn from(err: OrchestrationError) -> Self {
        QueueError::State(err.to_string())
    }
}

impl From<QueueError> for OrchestrationError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Decode(_) | QueueError::UnsupportedVersion { .. } | QueueError::InvalidMessage(_) => {
                OrchestrationError::InvalidMessage(err.to_string())
            }
            other => OrchestrationError::InternalError(other.to_string()),
        }
    }
}
