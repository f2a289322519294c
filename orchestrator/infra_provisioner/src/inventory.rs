//! Host inventory derived from provisioned infrastructure.
//!
//! The cluster directory carries an executable dynamic-inventory script
//! (`hosts`) that reads Terraform state. Running it with `--list` yields the
//! usual Ansible inventory JSON: `_meta.hostvars` plus one entry per group,
//! either a bare host list or an object with `hosts`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_shared_types::OrchestrationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::diagnostics::clean_output;
use crate::process::{ToolCommand, ToolError};

/// Group names under which the control-plane hosts may appear.
const MASTER_GROUPS: &[&str] = &["kube_control_plane", "kube-master", "masters"];

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Inventory script failed (exit {code:?}): {message}")]
    ScriptFailed { code: Option<i32>, message: String },

    #[error("Inventory output is not valid JSON: {0}")]
    Parse(String),

    #[error("Inventory is empty")]
    Empty,

    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl From<InventoryError> for OrchestrationError {
    fn from(err: InventoryError) -> Self {
        OrchestrationError::InventoryError(err.to_string())
    }
}

/// Variables of one host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostVars {
    /// Address Ansible connects to.
    pub ip: Option<String>,
    /// Floating or load-balancer address reachable from outside.
    pub access_ip: Option<String>,
    /// Cloud server id.
    pub provider_id: Option<String>,
    /// Networks the host is attached to.
    pub networks: Vec<String>,
    /// Every other variable, untouched.
    pub extra: Map<String, Value>,
}

impl HostVars {
    fn from_json(vars: &Map<String, Value>) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| vars.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        let networks = match vars.get("network") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        const KNOWN: &[&str] = &[
            "ansible_host",
            "ip",
            "access_ip",
            "loadbalancer_ip",
            "id",
            "provider_id",
            "network",
        ];
        let extra = vars
            .iter()
            .filter(|(k, _)| !KNOWN.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        HostVars {
            ip: text(&["ansible_host", "ip"]),
            access_ip: text(&["access_ip", "loadbalancer_ip"]),
            provider_id: text(&["provider_id", "id"]),
            networks,
            extra,
        }
    }

    /// Address used from outside the cluster network.
    pub fn public_address(&self) -> Option<&str> {
        self.access_ip.as_deref().or(self.ip.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostInventory {
    pub hosts: BTreeMap<String, HostVars>,
    pub groups: BTreeMap<String, Vec<String>>,
}

impl HostInventory {
    /// Parse `--list` output.
    pub fn parse(raw: &str) -> Result<Self, InventoryError> {
        let root: Map<String, Value> =
            serde_json::from_str(raw).map_err(|e| InventoryError::Parse(e.to_string()))?;

        let mut hosts = BTreeMap::new();
        if let Some(hostvars) = root
            .get("_meta")
            .and_then(|m| m.get("hostvars"))
            .and_then(Value::as_object)
        {
            for (name, vars) in hostvars {
                let vars = vars.as_object().cloned().unwrap_or_default();
                hosts.insert(name.clone(), HostVars::from_json(&vars));
            }
        }

        let mut groups = BTreeMap::new();
        for (name, entry) in root.iter().filter(|(k, _)| k.as_str() != "_meta") {
            let members = match entry {
                Value::Array(items) => items.clone(),
                Value::Object(obj) => obj
                    .get("hosts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let members: Vec<String> = members
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            for host in &members {
                hosts.entry(host.clone()).or_default();
            }
            groups.insert(name.clone(), members);
        }

        Ok(HostInventory { hosts, groups })
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, host: &str) -> Option<&HostVars> {
        self.hosts.get(host)
    }

    /// Control-plane hosts in name order.
    pub fn masters(&self) -> Vec<String> {
        let mut masters: Vec<String> = MASTER_GROUPS
            .iter()
            .filter_map(|g| self.groups.get(*g))
            .flatten()
            .cloned()
            .collect();
        masters.sort();
        masters.dedup();
        masters
    }

    pub fn first_master(&self) -> Option<String> {
        self.masters().into_iter().next()
    }

    /// Restrict to `names`, dropping other hosts from every group.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> HostInventory {
        let keep = |h: &String| names.iter().any(|n| n.as_ref() == h);
        HostInventory {
            hosts: self
                .hosts
                .iter()
                .filter(|(h, _)| keep(h))
                .map(|(h, v)| (h.clone(), v.clone()))
                .collect(),
            groups: self
                .groups
                .iter()
                .map(|(g, members)| (g.clone(), members.iter().filter(|h| keep(h)).cloned().collect()))
                .collect(),
        }
    }
}

/// Produces the host inventory of a provisioned cluster.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn resolve(&self, hosts_script: &Path, root_dir: &Path) -> Result<HostInventory, InventoryError>;
}

/// Runs the dynamic-inventory script.
#[derive(Debug, Clone)]
pub struct ScriptInventory {
    timeout: Duration,
}

impl ScriptInventory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl InventorySource for ScriptInventory {
    async fn resolve(&self, hosts_script: &Path, root_dir: &Path) -> Result<HostInventory, InventoryError> {
        let output = ToolCommand::new(hosts_script.to_string_lossy())
            .arg("--list")
            .current_dir(root_dir)
            .timeout(self.timeout)
            .output()
            .await?;

        if !output.success() {
            return Err(InventoryError::ScriptFailed {
                code: output.code,
                message: clean_output(output.diagnostic()),
            });
        }

        let inventory = HostInventory::parse(&output.stdout)?;
        if inventory.is_empty() {
            return Err(InventoryError::Empty);
        }
        debug!(groups = ?inventory.groups.keys().collect::<Vec<_>>(), "Parsed inventory");
        info!(hosts = inventory.hosts.len(), "Inventory resolved");
        Ok(inventory)
    }
}
