//! Infrastructure side of the provisioning engine.
//!
//! - `Provisioner`: create, grow, shrink and destroy a cluster's machines
//! - `TerraformProvisioner`: the Terraform-backed implementation
//! - `tfvars`: the persisted infrastructure description
//! - `inventory`: host inventory from the cluster's dynamic-inventory script
//! - `process`: external tool invocation shared with the configuration runner
//!
//! With the `mock` feature, `MockProvisioner` and `MockInventory` stand in
//! for Terraform and the inventory script in workflow tests.

use std::path::PathBuf;

use async_trait::async_trait;
use cloud_api::CloudApiError;
use orchestrator_shared_types::{Cluster, ClusterId, OrchestrationError};
use state_store_interface::ProgressTracker;

pub mod diagnostics;
pub mod inventory;
pub mod process;
pub mod terraform;
pub mod tfvars;
pub mod workdir;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use inventory::{HostInventory, HostVars, InventoryError, InventorySource, ScriptInventory};
pub use terraform::{TerraformOutputs, TerraformProvisioner};
pub use tfvars::{MachineGroup, MachineSpec, TfVars};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockInventory, MockProvisioner};

/// Errors from provisioning internals. Tool failures during apply and
/// destroy are reported through `ProvisionOutcome` instead.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid infrastructure description: {0}")]
    Description(String),

    #[error("Working directory error: {0}")]
    Workdir(String),

    #[error("{command} failed: {message}")]
    ToolFailed { command: String, message: String },

    #[error(transparent)]
    Tool(#[from] process::ToolError),

    #[error(transparent)]
    Cloud(#[from] CloudApiError),
}

impl From<ProvisionerError> for OrchestrationError {
    fn from(err: ProvisionerError) -> Self {
        OrchestrationError::ProvisionError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;

/// Result of an apply or destroy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub ok: bool,
    /// Cleaned tool diagnostic on failure; a note on reclassified success.
    pub message: String,
}

impl ProvisionOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Drives the infrastructure-as-code tool for one cluster at a time.
///
/// Callers open the progress phase; on tool failure the implementation closes
/// it as `failed` with the diagnostic and returns `ok = false`. `Err` is
/// reserved for failures outside the tool run (store, filesystem).
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Apply `desc`. On first creation this also prepares the working
    /// directory, keypair and shared network objects, and afterwards records
    /// the private key and network ids on `cluster`.
    async fn provision(
        &self,
        cluster: &mut Cluster,
        desc: &mut TfVars,
        tracker: &ProgressTracker,
        is_scale_out: bool,
    ) -> orchestrator_shared_types::Result<ProvisionOutcome>;

    /// Destroy everything in the cluster's state.
    async fn destroy(
        &self,
        cluster_id: &ClusterId,
        tracker: &ProgressTracker,
    ) -> orchestrator_shared_types::Result<ProvisionOutcome>;

    /// Forget `names` in the tool state and the persisted description, and
    /// return the updated description. Absent names are skipped.
    async fn remove_nodes(
        &self,
        cluster_id: &ClusterId,
        names: &[String],
    ) -> orchestrator_shared_types::Result<TfVars>;

    async fn load_description(&self, cluster_id: &ClusterId) -> orchestrator_shared_types::Result<TfVars>;

    async fn save_description(
        &self,
        cluster_id: &ClusterId,
        desc: &TfVars,
    ) -> orchestrator_shared_types::Result<()>;

    fn workdir_exists(&self, cluster_id: &ClusterId) -> bool;

    /// Move the working directory aside after a destroy; returns the new path.
    async fn retire_workdir(&self, cluster_id: &ClusterId) -> orchestrator_shared_types::Result<Option<PathBuf>>;
}
