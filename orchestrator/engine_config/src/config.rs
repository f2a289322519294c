//! Engine configuration model.
//!
//! Every section carries `#[serde(default)]`, so a partial file only needs to
//! name what differs from the defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use orchestrator_shared_types::{ClusterId, Phase};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::paths::{default_config_file, ClusterPaths};

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub tools: ToolsConfig,
    pub playbooks: PlaybookConfig,
    pub ssh: SshConfig,
    pub reachability: ReachabilityConfig,
    pub limits: LimitsConfig,
    pub workers: WorkerConfig,
    pub openstack: OpenStackConfig,
    pub instances: InstanceSettings,
    /// Per playbook kind (`cluster`, `scale`, `remove_node`), a replacement
    /// marker table.
    pub markers: BTreeMap<String, Vec<MarkerOverride>>,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Load from `$PROVISIOND_CONFIG` or the XDG location, falling back to
    /// defaults when no file exists there.
    pub async fn load_default() -> Result<Self> {
        let path = default_config_file()?;
        if tokio::fs::try_exists(&path).await? {
            Self::load(&path).await
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Serialize back to TOML, e.g. to print the effective configuration.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reachability.interval_secs == 0 {
            return Err(ConfigError::validation("reachability.interval_secs must be > 0"));
        }
        if self.instances.poll_interval_secs == 0 {
            return Err(ConfigError::validation("instances.poll_interval_secs must be > 0"));
        }
        if self.instances.port_range_start > self.instances.port_range_end {
            return Err(ConfigError::validation(format!(
                "instances port range {}-{} is empty",
                self.instances.port_range_start, self.instances.port_range_end
            )));
        }
        if self.instances.port_attempts == 0 {
            return Err(ConfigError::validation("instances.port_attempts must be > 0"));
        }
        if self.workers.concurrency == 0 {
            return Err(ConfigError::validation("workers.concurrency must be > 0"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::validation("workers.queue_capacity must be > 0"));
        }
        self.limits.default.validate("limits.default")?;
        for (task, limit) in &self.limits.tasks {
            limit.validate(&format!("limits.tasks.{task}"))?;
        }
        for (kind, markers) in &self.markers {
            if markers.iter().any(|m| m.task.trim().is_empty()) {
                return Err(ConfigError::validation(format!(
                    "markers.{kind}: marker task names must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Working-directory layout for one cluster.
    pub fn cluster_paths(&self, cluster_id: &ClusterId) -> ClusterPaths {
        ClusterPaths::new(&self.paths.clusters_root, cluster_id)
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent of every per-cluster working directory.
    pub clusters_root: PathBuf,
    /// Skeleton of a cluster directory (`terraform/` sources and the `hosts`
    /// inventory script), copied into the cluster root on first creation.
    pub template_dir: PathBuf,
    /// Directory holding the Ansible playbooks.
    pub playbook_dir: PathBuf,
    /// SQLite database file.
    pub database: PathBuf,
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(crate::APP_NAME))
        .unwrap_or_else(|| PathBuf::from("/var/lib").join(crate::APP_NAME))
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = data_root();
        Self {
            clusters_root: root.join("clusters"),
            template_dir: root.join("templates").join("terraform"),
            playbook_dir: root.join("playbooks"),
            database: root.join("engine.sqlite"),
        }
    }
}

/// External executables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    pub terraform: String,
    pub ansible_runner: String,
    pub ansible: String,
    pub ssh_keygen: String,
    /// Bound for short helper commands (keygen, state list, output).
    pub short_command_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            terraform: "terraform".into(),
            ansible_runner: "ansible-runner".into(),
            ansible: "ansible".into(),
            ssh_keygen: "ssh-keygen".into(),
            short_command_timeout_secs: 300,
        }
    }
}

impl ToolsConfig {
    pub fn short_command_timeout(&self) -> Duration {
        Duration::from_secs(self.short_command_timeout_secs)
    }
}

/// Playbook file names, relative to `paths.playbook_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybookConfig {
    pub cluster: String,
    pub scale: String,
    pub remove_node: String,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            cluster: "cluster.yml".into(),
            scale: "scale.yml".into(),
            remove_node: "remove-node.yml".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// Login user on provisioned machines.
    pub user: String,
    pub key_bits: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".into(),
            key_bits: 4096,
        }
    }
}

/// Bounds for the connectivity check after provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub max_wait_secs: u64,
    pub interval_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 600,
            interval_secs: 10,
        }
    }
}

impl ReachabilityConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Soft and hard wall-clock limits of one task execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeLimit {
    pub soft_secs: u64,
    pub hard_secs: u64,
}

impl TimeLimit {
    pub fn soft(&self) -> Duration {
        Duration::from_secs(self.soft_secs)
    }

    pub fn hard(&self) -> Duration {
        Duration::from_secs(self.hard_secs)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.soft_secs == 0 || self.soft_secs >= self.hard_secs {
            return Err(ConfigError::validation(format!(
                "{name}: soft limit ({}s) must be non-zero and below the hard limit ({}s)",
                self.soft_secs, self.hard_secs
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub default: TimeLimit,
    /// Overrides keyed by task name (`create_k8s_cluster`, `delete_cluster`, ...).
    pub tasks: BTreeMap<String, TimeLimit>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let mut tasks = BTreeMap::new();
        // Kubernetes installs routinely take over an hour on slow clouds.
        tasks.insert(
            "create_k8s_cluster".to_string(),
            TimeLimit { soft_secs: 3 * 3600, hard_secs: 3 * 3600 + 600 },
        );
        tasks.insert(
            "create_instance".to_string(),
            TimeLimit { soft_secs: 1200, hard_secs: 1500 },
        );
        tasks.insert(
            "delete_instance".to_string(),
            TimeLimit { soft_secs: 1200, hard_secs: 1500 },
        );
        Self {
            default: TimeLimit { soft_secs: 3600, hard_secs: 3900 },
            tasks,
        }
    }
}

impl LimitsConfig {
    pub fn for_task(&self, task: &str) -> TimeLimit {
        self.tasks.get(task).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Workflows executing at the same time.
    pub concurrency: usize,
    /// Accepted messages waiting for a worker.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 64,
        }
    }
}

/// Keystone credentials and network names used on the cloud side.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenStackConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain: String,
    pub project_name: String,
    pub project_domain: String,
    pub region: Option<String>,
    /// Endpoint interface picked from the service catalog.
    pub interface: String,
    /// Shared router every cluster network attaches to.
    pub router_name: String,
    /// Tag identifying the floating IP reserved for the bastion.
    pub bastion_tag: String,
    pub external_network: String,
    pub floatingip_pool: String,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://localhost:5000/v3".into(),
            username: "admin".into(),
            password: String::new(),
            user_domain: "Default".into(),
            project_name: "admin".into(),
            project_domain: "Default".into(),
            region: None,
            interface: "public".into(),
            router_name: "router".into(),
            bastion_tag: "bastion".into(),
            external_network: "public".into(),
            floatingip_pool: "public".into(),
        }
    }
}

impl fmt::Debug for OpenStackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackConfig")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_name", &self.project_name)
            .field("region", &self.region)
            .field("router_name", &self.router_name)
            .field("bastion_tag", &self.bastion_tag)
            .finish()
    }
}

/// Standalone server handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstanceSettings {
    /// How long to wait for a server to become active or disappear.
    pub poll_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Inclusive range external ports are drawn from.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Random ports tried per rule before giving up.
    pub port_attempts: u32,
    pub port_retry_interval_ms: u64,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 600,
            poll_interval_secs: 5,
            port_range_start: 30000,
            port_range_end: 60000,
            port_attempts: 20,
            port_retry_interval_ms: 200,
        }
    }
}

impl InstanceSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn port_retry_interval(&self) -> Duration {
        Duration::from_millis(self.port_retry_interval_ms)
    }
}

/// One entry of a marker table: when `task` first completes, `phase` opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkerOverride {
    pub task: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
