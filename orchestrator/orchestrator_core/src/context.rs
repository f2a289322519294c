//! Collaborators shared by every workflow execution.

use std::sync::Arc;

use cloud_api::CloudClients;
use config_runner::{PingCheck, PingRequest, PlaybookKind, PlaybookRunner, ReachabilityProber, RunRequest};
use engine_config::{ClusterPaths, EngineConfig};
use infra_provisioner::{InventorySource, Provisioner, TfVars};
use orchestrator_shared_types::{Cluster, ClusterId, OrchestrationError, Result};
use state_store_interface::{ProgressTracker, StateStore};

pub struct WorkflowContext {
    pub store: Arc<dyn StateStore>,
    pub provisioner: Arc<dyn Provisioner>,
    pub inventory: Arc<dyn InventorySource>,
    pub runner: Arc<dyn PlaybookRunner>,
    pub prober: ReachabilityProber,
    pub cloud: CloudClients,
    pub config: Arc<EngineConfig>,
}

impl WorkflowContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        provisioner: Arc<dyn Provisioner>,
        inventory: Arc<dyn InventorySource>,
        runner: Arc<dyn PlaybookRunner>,
        ping: Arc<dyn PingCheck>,
        cloud: CloudClients,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            provisioner,
            inventory,
            runner,
            prober: ReachabilityProber::new(ping),
            cloud,
            config,
        }
    }

    pub fn paths(&self, cluster_id: &ClusterId) -> ClusterPaths {
        self.config.cluster_paths(cluster_id)
    }

    pub fn tracker(&self, task_id: &str, cluster_id: ClusterId) -> ProgressTracker {
        ProgressTracker::new(self.store.clone(), task_id, cluster_id)
    }

    pub async fn load_cluster(&self, cluster_id: &ClusterId) -> Result<Cluster> {
        self.store
            .get_cluster(cluster_id)
            .await?
            .ok_or(OrchestrationError::ClusterNotFound(*cluster_id))
    }

    /// Ping request for a cluster's working directory.
    pub fn ping_request(&self, paths: &ClusterPaths, desc: &TfVars) -> PingRequest {
        PingRequest {
            inventory: paths.hosts_script(),
            key_file: (!desc.uses_password()).then(|| paths.private_key()),
            user: self.ssh_user(desc),
            working_dir: paths.root().to_path_buf(),
            log_file: paths.connection_check_log(),
        }
    }

    pub fn ssh_user(&self, desc: &TfVars) -> String {
        if desc.ssh_user.is_empty() {
            self.config.ssh.user.clone()
        } else {
            desc.ssh_user.clone()
        }
    }

    /// Playbook run for the cluster, authenticated the way `desc` asks for.
    pub fn playbook_request(&self, kind: PlaybookKind, paths: &ClusterPaths, desc: &TfVars) -> RunRequest {
        let request = RunRequest::for_cluster(kind, paths, &self.config).extra_var("ansible_user", self.ssh_user(desc));
        match desc.password.as_ref().filter(|p| !p.is_empty()) {
            Some(password) => request
                .without_key()
                .extra_var("ansible_password", password.clone()),
            None => request,
        }
    }

    /// Put a fresh token and its issuer into `desc` before handing it to Terraform.
    pub async fn refresh_credentials(&self, desc: &mut TfVars) -> Result<()> {
        let token = self.cloud.tokens.valid_or_refresh().await?;
        desc.token = token.value;
        desc.auth_url = token.auth_url;
        Ok(())
    }
}
