//! Terraform-backed `Provisioner`.
//!
//! All commands run inside `<cluster>/terraform` with the persisted
//! description as var-file. Long runs (init, apply, destroy) are streamed
//! into `terraform.log`; state queries are captured under the short-command
//! timeout.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cloud_api::NetworkApi;
use engine_config::{ClusterPaths, EngineConfig};
use observability::tool_span;
use orchestrator_shared_types::{Cluster, ClusterId};
use serde_json::{Map, Value};
use state_store_interface::ProgressTracker;
use tracing::{info, warn, Instrument};

use crate::diagnostics::{clean_output, is_destroy_conflict};
use crate::process::{ToolCommand, ToolOutput};
use crate::tfvars::TfVars;
use crate::workdir::{ensure_keypair, seed_from_template};
use crate::{ProvisionOutcome, Provisioner, ProvisionerError, Result};

const VAR_FILE: &str = "output.tfvars.json";

/// Values read back from `terraform output -json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerraformOutputs {
    pub network_id: Option<String>,
    pub subnet_id: Option<String>,
    pub router_id: Option<String>,
    pub bastion_ip: Option<String>,
    pub other: Map<String, Value>,
}

impl TerraformOutputs {
    /// Each output is `{"value": ...}`; list values contribute their first element.
    pub fn parse(raw: &str) -> Result<Self> {
        let root: Map<String, Value> = serde_json::from_str(raw)?;
        let mut outputs = TerraformOutputs::default();
        for (name, entry) in root {
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            let text = match &value {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
                _ => None,
            };
            match name.as_str() {
                "network_id" => outputs.network_id = text,
                "subnet_id" => outputs.subnet_id = text,
                "router_id" => outputs.router_id = text,
                "bastion_ip" | "bastion_fips" => outputs.bastion_ip = text,
                _ => {
                    outputs.other.insert(name, value);
                }
            }
        }
        Ok(outputs)
    }

    fn apply_to(&self, cluster: &mut Cluster) {
        let net = &mut cluster.network;
        if self.network_id.is_some() {
            net.network_id = self.network_id.clone();
        }
        if self.subnet_id.is_some() {
            net.subnet_id = self.subnet_id.clone();
        }
        if self.router_id.is_some() {
            net.router_id = self.router_id.clone();
        }
        if self.bastion_ip.is_some() {
            net.bastion_ip = self.bastion_ip.clone();
        }
    }
}

pub struct TerraformProvisioner {
    config: Arc<EngineConfig>,
    network: Arc<dyn NetworkApi>,
}

impl TerraformProvisioner {
    pub fn new(config: Arc<EngineConfig>, network: Arc<dyn NetworkApi>) -> Self {
        Self { config, network }
    }

    fn paths(&self, cluster_id: &ClusterId) -> ClusterPaths {
        self.config.cluster_paths(cluster_id)
    }

    fn terraform(&self, paths: &ClusterPaths) -> ToolCommand {
        ToolCommand::new(&self.config.tools.terraform)
            .current_dir(paths.terraform_dir())
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
    }

    /// Streamed run; output is appended to `terraform.log`.
    async fn run_logged(&self, paths: &ClusterPaths, args: &[&str]) -> Result<ToolOutput> {
        let cmd = self.terraform(paths).args(args.iter().copied());
        let running = cmd.stream_to(&paths.terraform_log()).await?;
        Ok(running.finish().await?)
    }

    async fn run_captured(&self, paths: &ClusterPaths, args: &[&str]) -> Result<ToolOutput> {
        Ok(self
            .terraform(paths)
            .args(args.iter().copied())
            .timeout(self.config.tools.short_command_timeout())
            .output()
            .await?)
    }

    /// Template, keypair and shared network objects for a brand-new cluster.
    async fn prepare_first_run(&self, paths: &ClusterPaths, cluster: &Cluster, desc: &mut TfVars) -> Result<()> {
        seed_from_template(&self.config.paths.template_dir, paths.root()).await?;

        if desc.ssh_user.is_empty() {
            desc.ssh_user = self.config.ssh.user.clone();
        }
        if !desc.uses_password() {
            ensure_keypair(
                &self.config.tools.ssh_keygen,
                &paths.private_key(),
                self.config.ssh.key_bits,
                &cluster.name,
                self.config.tools.short_command_timeout(),
            )
            .await?;
            desc.private_key_path = Some(paths.private_key().to_string_lossy().into_owned());
            desc.public_key_path = Some(paths.public_key().to_string_lossy().into_owned());
        }

        let os = &self.config.openstack;
        let router = self
            .network
            .find_router_by_name(&os.router_name)
            .await?
            .ok_or_else(|| ProvisionerError::Workdir(format!("router {} not found", os.router_name)))?;
        desc.router_id = Some(router.id);

        match self.network.find_floating_ip_by_tag(&os.bastion_tag).await? {
            Some(fip) => {
                desc.bastion_floating_ip_id = Some(fip.id);
                desc.bastion_floating_ip = Some(fip.address);
            }
            None => warn!(tag = %os.bastion_tag, "No bastion floating IP found"),
        }
        desc.external_net.get_or_insert_with(|| os.external_network.clone());
        desc.floatingip_pool.get_or_insert_with(|| os.floatingip_pool.clone());
        Ok(())
    }

    async fn apply(&self, cluster: &mut Cluster, desc: &mut TfVars, is_scale_out: bool) -> Result<ProvisionOutcome> {
        let paths = self.paths(&cluster.id);
        if !is_scale_out {
            self.prepare_first_run(&paths, cluster, desc).await?;
        }
        desc.save(paths.tfvars_file()).await?;

        let init = self.run_logged(&paths, &["init", "-input=false"]).await?;
        if !init.success() {
            return Ok(ProvisionOutcome::failed(clean_output(init.diagnostic())));
        }

        let var_file = format!("-var-file={VAR_FILE}");
        let apply = self
            .run_logged(&paths, &["apply", "-auto-approve", "-input=false", &var_file])
            .await?;
        if !apply.success() {
            return Ok(ProvisionOutcome::failed(clean_output(apply.diagnostic())));
        }

        let out = self.run_captured(&paths, &["output", "-json"]).await?;
        if !out.success() {
            return Ok(ProvisionOutcome::failed(clean_output(out.diagnostic())));
        }
        TerraformOutputs::parse(&out.stdout)?.apply_to(cluster);

        if !desc.uses_password() && tokio::fs::try_exists(paths.private_key()).await? {
            cluster.private_key = Some(tokio::fs::read_to_string(paths.private_key()).await?);
        }
        Ok(ProvisionOutcome::ok())
    }

    /// Per-node resource addresses in state, i.e. those indexed by `["name"]`.
    fn addresses_for<'a>(state: &'a [String], name: &str) -> Vec<&'a str> {
        let suffix = format!("[\"{name}\"]");
        state
            .iter()
            .map(String::as_str)
            .filter(|addr| addr.ends_with(&suffix))
            .collect()
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn provision(
        &self,
        cluster: &mut Cluster,
        desc: &mut TfVars,
        tracker: &ProgressTracker,
        is_scale_out: bool,
    ) -> orchestrator_shared_types::Result<ProvisionOutcome> {
        let span = tool_span!("terraform", cluster.id, if is_scale_out { "scale" } else { "create" });
        let outcome = match self.apply(cluster, desc, is_scale_out).instrument(span).await {
            Ok(outcome) => outcome,
            // Anything short of a store failure is reported as a failed run.
            Err(err) => ProvisionOutcome::failed(err.to_string()),
        };
        if outcome.ok {
            info!(cluster_id = %cluster.id, "Infrastructure applied");
        } else {
            warn!(cluster_id = %cluster.id, message = %outcome.message, "Infrastructure apply failed");
            tracker.fail(&outcome.message).await?;
        }
        Ok(outcome)
    }

    async fn destroy(
        &self,
        cluster_id: &ClusterId,
        tracker: &ProgressTracker,
    ) -> orchestrator_shared_types::Result<ProvisionOutcome> {
        let paths = self.paths(cluster_id);
        let var_file = format!("-var-file={VAR_FILE}");
        let run = self
            .run_logged(&paths, &["destroy", "-auto-approve", "-input=false", &var_file])
            .instrument(tool_span!("terraform", cluster_id, "destroy"))
            .await;

        let outcome = match run {
            Ok(out) if out.success() => ProvisionOutcome::ok(),
            Ok(out) if is_destroy_conflict(&out.combined()) => {
                let message = clean_output(out.diagnostic());
                warn!(
                    cluster_id = %cluster_id,
                    message = %message,
                    "Destroy left resources in use elsewhere, treating as success"
                );
                ProvisionOutcome::ok_with(message)
            }
            Ok(out) => ProvisionOutcome::failed(clean_output(out.diagnostic())),
            Err(err) => ProvisionOutcome::failed(err.to_string()),
        };
        if !outcome.ok {
            tracker.fail(&outcome.message).await?;
        }
        Ok(outcome)
    }

    async fn remove_nodes(
        &self,
        cluster_id: &ClusterId,
        names: &[String],
    ) -> orchestrator_shared_types::Result<TfVars> {
        let paths = self.paths(cluster_id);
        let listed = self.run_captured(&paths, &["state", "list"]).await?;
        if !listed.success() {
            return Err(ProvisionerError::ToolFailed {
                command: "terraform state list".into(),
                message: clean_output(listed.diagnostic()),
            }
            .into());
        }
        let state: Vec<String> = listed.stdout.lines().map(|l| l.trim().to_string()).collect();

        for name in names {
            let addresses = Self::addresses_for(&state, name);
            if addresses.is_empty() {
                info!(cluster_id = %cluster_id, node = %name, "Node not in state, skipping");
                continue;
            }
            let mut args = vec!["state", "rm"];
            args.extend(addresses.iter().copied());
            let removed = self.run_captured(&paths, &args).await?;
            if !removed.success() {
                return Err(ProvisionerError::ToolFailed {
                    command: "terraform state rm".into(),
                    message: clean_output(removed.diagnostic()),
                }
                .into());
            }
            info!(cluster_id = %cluster_id, node = %name, resources = addresses.len(), "Removed node from state");
        }

        let mut desc = TfVars::load(paths.tfvars_file()).await?;
        let dropped = desc.remove_nodes(names);
        desc.save(paths.tfvars_file()).await?;
        info!(cluster_id = %cluster_id, dropped = ?dropped, "Updated infrastructure description");
        Ok(desc)
    }

    async fn load_description(&self, cluster_id: &ClusterId) -> orchestrator_shared_types::Result<TfVars> {
        Ok(TfVars::load(self.paths(cluster_id).tfvars_file()).await?)
    }

    async fn save_description(
        &self,
        cluster_id: &ClusterId,
        desc: &TfVars,
    ) -> orchestrator_shared_types::Result<()> {
        Ok(desc.save(self.paths(cluster_id).tfvars_file()).await?)
    }

    fn workdir_exists(&self, cluster_id: &ClusterId) -> bool {
        self.paths(cluster_id).exists()
    }

    async fn retire_workdir(&self, cluster_id: &ClusterId) -> orchestrator_shared_types::Result<Option<PathBuf>> {
        let paths = self.paths(cluster_id);
        if !paths.exists() {
            return Ok(None);
        }
        let target = paths.tombstone(&Utc::now().format("%Y%m%d%H%M%S").to_string());
        tokio::fs::rename(paths.root(), &target)
            .await
            .map_err(ProvisionerError::from)?;
        info!(cluster_id = %cluster_id, moved_to = %target.display(), "Retired working directory");
        Ok(Some(target))
    }
}
