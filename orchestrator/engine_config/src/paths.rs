//! Configuration file location and per-cluster working-directory layout.

use std::path::{Path, PathBuf};

use orchestrator_shared_types::ClusterId;

use crate::{error::Result, ConfigError, APP_NAME, CONFIG_ENV};

/// `$PROVISIOND_CONFIG`, or `engine.toml` under the XDG config directory.
pub fn default_config_file() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::PathError("Could not determine config directory".into()))?;
    Ok(dir.join(APP_NAME).join("engine.toml"))
}

/// Layout of one cluster's working directory.
///
/// ```text
/// <clusters_root>/<cluster_id>/
///     terraform/output.tfvars.json
///     hosts
///     id_rsa, id_rsa.pub
///     ansible_debug.log, ansible_scale.log, ansible_remove.log
///     connection_check.log, terraform.log
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPaths {
    root: PathBuf,
}

impl ClusterPaths {
    pub fn new(clusters_root: impl AsRef<Path>, cluster_id: &ClusterId) -> Self {
        Self {
            root: clusters_root.as_ref().join(cluster_id.to_string()),
        }
    }

    /// Use an explicit directory (for testing).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn terraform_dir(&self) -> PathBuf {
        self.root.join("terraform")
    }

    /// Persisted infrastructure description.
    pub fn tfvars_file(&self) -> PathBuf {
        self.terraform_dir().join("output.tfvars.json")
    }

    /// Executable dynamic-inventory script.
    pub fn hosts_script(&self) -> PathBuf {
        self.root.join("hosts")
    }

    pub fn private_key(&self) -> PathBuf {
        self.root.join("id_rsa")
    }

    pub fn public_key(&self) -> PathBuf {
        self.root.join("id_rsa.pub")
    }

    /// Private data directory handed to ansible-runner.
    pub fn runner_dir(&self) -> PathBuf {
        self.root.join("runner")
    }

    pub fn ansible_debug_log(&self) -> PathBuf {
        self.root.join("ansible_debug.log")
    }

    pub fn ansible_scale_log(&self) -> PathBuf {
        self.root.join("ansible_scale.log")
    }

    pub fn ansible_remove_log(&self) -> PathBuf {
        self.root.join("ansible_remove.log")
    }

    pub fn connection_check_log(&self) -> PathBuf {
        self.root.join("connection_check.log")
    }

    pub fn terraform_log(&self) -> PathBuf {
        self.root.join("terraform.log")
    }

    /// Where the directory is moved after a successful destroy.
    pub fn tombstone(&self, stamp: &str) -> PathBuf {
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.with_file_name(format!("{name}.deleted-{stamp}"))
    }
}
