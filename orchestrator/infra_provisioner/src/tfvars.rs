//! Infrastructure description handed to Terraform as a JSON var-file.
//!
//! The description is written once at cluster creation and reloaded by every
//! later operation (scale-out, node removal, destroy), which mutate it and
//! write it back. Keys this model does not know about are carried through a
//! round trip unchanged.

use std::collections::BTreeMap;
use std::path::Path;

use orchestrator_shared_types::{ClusterId, PortForward, Resources};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ProvisionerError, Result};

/// Role of a machine in the Terraform template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MachineGroup {
    Master,
    Worker,
    Baremetal,
}

/// Shape of one machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineSpec {
    pub group: MachineGroup,
    pub flavor: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub floating_ip: bool,
    #[serde(default)]
    pub use_local_disk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_forwards: Vec<PortForward>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TfVars {
    pub cluster_name: String,
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    /// Set when password login was requested instead of a generated keypair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_net: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floatingip_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_floating_ip_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_floating_ip: Option<String>,
    /// Machines keyed by node name.
    #[serde(default)]
    pub nodes: BTreeMap<String, MachineSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TfVars {
    pub fn new(cluster_name: impl Into<String>, cluster_id: ClusterId) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cluster_id,
            auth_url: String::new(),
            token: String::new(),
            ssh_user: String::new(),
            public_key_path: None,
            private_key_path: None,
            password: None,
            network_id: None,
            subnet_id: None,
            router_id: None,
            external_net: None,
            floatingip_pool: None,
            bastion_floating_ip_id: None,
            bastion_floating_ip: None,
            nodes: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn uses_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Drop `names` from the description, returning the names that were present.
    pub fn remove_nodes<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<String> {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                self.nodes.remove(name).map(|_| name.to_string())
            })
            .collect()
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&text).map_err(|e| {
            ProvisionerError::Description(format!("{}: {e}", path.display()))
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(self)?;
        // Write-then-rename so a crash never leaves a truncated description.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
