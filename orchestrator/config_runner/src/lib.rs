//! Configuration-management side of the provisioning engine.
//!
//! - `PlaybookRunner`: runs a playbook through ansible-runner and turns its
//!   event stream into progress phases via a `MarkerTable`
//! - `reachability`: waits until every inventory host answers a ping
//! - `kubeconfig`: pulls the admin kubeconfig off the first master

use std::path::PathBuf;

use async_trait::async_trait;
use engine_config::{ClusterPaths, EngineConfig};
use infra_provisioner::process::ToolError;
use orchestrator_shared_types::OrchestrationError;
use serde_json::{Map, Value};
use state_store_interface::ProgressTracker;

pub mod ansible;
pub mod events;
pub mod kubeconfig;
pub mod markers;
pub mod reachability;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use ansible::AnsibleRunner;
pub use markers::{Marker, MarkerTable, PhaseSequencer, PlaybookKind};
pub use reachability::{AnsiblePing, PingCheck, PingReport, PingRequest, ReachabilityProber};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockPing, MockRunner};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("{} not reachable after {elapsed:?} ({retries} retries)", hosts.join(", "))]
    Unreachable {
        hosts: Vec<String>,
        elapsed: std::time::Duration,
        retries: u32,
    },

    #[error("Failed to fetch kubeconfig: {0}")]
    Kubeconfig(String),
}

impl From<RunnerError> for OrchestrationError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Unreachable { .. } => OrchestrationError::ReachabilityError(err.to_string()),
            other => OrchestrationError::RunnerError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// One playbook run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub kind: PlaybookKind,
    /// Playbook file name inside `project_dir`.
    pub playbook: String,
    pub project_dir: PathBuf,
    /// ansible-runner private data directory (env/, artifacts/).
    pub private_data_dir: PathBuf,
    /// Inventory path handed to ansible (the dynamic `hosts` script).
    pub inventory: PathBuf,
    /// Absent when the cluster uses password login.
    pub ssh_key: Option<PathBuf>,
    pub limit_hosts: Vec<String>,
    pub extra_vars: Map<String, Value>,
    pub log_file: PathBuf,
    /// Markers used to derive progress phases from the event stream.
    pub markers: MarkerTable,
}

impl RunRequest {
    /// Request for `kind` against a cluster's working directory, with the
    /// playbook and markers taken from the engine configuration.
    pub fn for_cluster(kind: PlaybookKind, paths: &ClusterPaths, config: &EngineConfig) -> Self {
        let (playbook, log_file) = match kind {
            PlaybookKind::Cluster => (&config.playbooks.cluster, paths.ansible_debug_log()),
            PlaybookKind::Scale => (&config.playbooks.scale, paths.ansible_scale_log()),
            PlaybookKind::RemoveNode => (&config.playbooks.remove_node, paths.ansible_remove_log()),
        };
        let mut extra_vars = Map::new();
        extra_vars.insert("ansible_user".into(), Value::String(config.ssh.user.clone()));
        RunRequest {
            kind,
            playbook: playbook.clone(),
            project_dir: config.paths.playbook_dir.clone(),
            private_data_dir: paths.runner_dir(),
            inventory: paths.hosts_script(),
            ssh_key: Some(paths.private_key()),
            limit_hosts: Vec::new(),
            extra_vars,
            log_file,
            markers: MarkerTable::for_kind(kind, &config.markers),
        }
    }

    pub fn without_key(mut self) -> Self {
        self.ssh_key = None;
        self
    }

    pub fn limit(mut self, hosts: Vec<String>) -> Self {
        self.limit_hosts = hosts;
        self
    }

    pub fn extra_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_vars.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub ok: bool,
    pub message: String,
}

/// Where and how to read the admin kubeconfig.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeconfigRequest {
    pub inventory: PathBuf,
    pub master: String,
    pub ssh_key: Option<PathBuf>,
    pub user: String,
    pub working_dir: PathBuf,
    /// Address written into the `server:` entries.
    pub public_address: Option<String>,
}

/// Runs playbooks against a cluster.
///
/// The caller does not open a phase for the run; the runner opens the
/// table's initial phase itself and advances through the markers. On success
/// the last phase is left open for the caller to close.
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(
        &self,
        request: &RunRequest,
        tracker: &ProgressTracker,
    ) -> orchestrator_shared_types::Result<RunOutcome>;

    async fn fetch_kubeconfig(&self, request: &KubeconfigRequest) -> orchestrator_shared_types::Result<String>;
}
