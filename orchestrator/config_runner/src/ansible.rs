//! `PlaybookRunner` backed by ansible-runner.

use std::sync::Arc;

use async_trait::async_trait;
use engine_config::ToolsConfig;
use infra_provisioner::diagnostics::clean_output;
use infra_provisioner::process::{Stream, ToolCommand};
use observability::tool_span;
use state_store_interface::ProgressTracker;
use tracing::{debug, info, warn, Instrument};

use crate::events::RunnerEvent;
use crate::kubeconfig;
use crate::{KubeconfigRequest, PlaybookRunner, Result, RunOutcome, RunRequest, RunnerError};

pub struct AnsibleRunner {
    tools: Arc<ToolsConfig>,
}

impl AnsibleRunner {
    pub fn new(tools: ToolsConfig) -> Self {
        Self {
            tools: Arc::new(tools),
        }
    }

    /// Write `env/extravars` and `env/ssh_key` into the private data dir.
    async fn prepare_private_data(&self, request: &RunRequest) -> Result<()> {
        let env_dir = request.private_data_dir.join("env");
        tokio::fs::create_dir_all(&env_dir).await?;

        let extravars = serde_json::to_string_pretty(&request.extra_vars)?;
        tokio::fs::write(env_dir.join("extravars"), extravars).await?;

        let key_file = env_dir.join("ssh_key");
        match &request.ssh_key {
            Some(key) => {
                tokio::fs::copy(key, &key_file).await?;
            }
            None => {
                if tokio::fs::try_exists(&key_file).await? {
                    tokio::fs::remove_file(&key_file).await?;
                }
            }
        }
        Ok(())
    }

    fn command(&self, request: &RunRequest) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.tools.ansible_runner)
            .arg("run")
            .arg(request.private_data_dir.to_string_lossy())
            .args(["-p", request.playbook.as_str()])
            .arg("--project-dir")
            .arg(request.project_dir.to_string_lossy())
            .arg("--inventory")
            .arg(request.inventory.to_string_lossy())
            .arg("-j")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_FORCE_COLOR", "0");
        if !request.limit_hosts.is_empty() {
            cmd = cmd.arg("--limit").arg(request.limit_hosts.join(","));
        }
        if let Some(dir) = request.inventory.parent() {
            cmd = cmd.current_dir(dir);
        }
        cmd
    }

    async fn execute(&self, request: &RunRequest, tracker: &ProgressTracker) -> orchestrator_shared_types::Result<RunOutcome> {
        self.prepare_private_data(request).await?;
        tracker.begin(request.markers.initial()).await?;

        let mut running = self
            .command(request)
            .stream_to(&request.log_file)
            .await
            .map_err(RunnerError::from)?;

        let mut sequencer = request.markers.sequencer();
        let mut last_failure: Option<String> = None;
        while let Some(line) = running.next_line().await.map_err(RunnerError::from)? {
            if line.stream != Stream::Stdout {
                continue;
            }
            let Some(event) = RunnerEvent::parse(&line.text) else {
                continue;
            };
            if event.is_failure() {
                let summary = event.failure_summary();
                warn!(kind = %request.kind, failure = %summary, "Playbook task failed");
                last_failure = Some(summary);
                continue;
            }
            if let Some(task) = event.completed_task() {
                if let Some(phase) = sequencer.observe(task) {
                    debug!(kind = %request.kind, task = %task, "Marker task completed");
                    tracker.begin(phase).await?;
                }
            }
        }

        let output = running.finish().await.map_err(RunnerError::from)?;
        if output.success() {
            info!(kind = %request.kind, "Playbook finished");
            return Ok(RunOutcome {
                ok: true,
                message: String::new(),
            });
        }

        let message = last_failure.unwrap_or_else(|| {
            let stderr = clean_output(&output.stderr);
            if stderr.is_empty() {
                format!("ansible-runner exited with {:?}", output.code)
            } else {
                stderr
            }
        });
        warn!(kind = %request.kind, code = ?output.code, message = %message, "Playbook failed");
        tracker.fail(&message).await?;
        Ok(RunOutcome { ok: false, message })
    }

    async fn slurp_admin_conf(&self, request: &KubeconfigRequest) -> Result<String> {
        let mut cmd = ToolCommand::new(&self.tools.ansible)
            .arg(&request.master)
            .arg("-i")
            .arg(request.inventory.to_string_lossy())
            .args(["-m", "slurp", "-a", kubeconfig::ADMIN_CONF_SLURP_ARGS])
            .args(["-u", request.user.as_str()])
            .arg("--become")
            .current_dir(&request.working_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .timeout(self.tools.short_command_timeout());
        if let Some(key) = &request.ssh_key {
            cmd = cmd.arg("--private-key").arg(key.to_string_lossy());
        }
        let output = cmd.output().await?;
        if !output.success() {
            return Err(RunnerError::Kubeconfig(clean_output(output.diagnostic())));
        }
        let raw = kubeconfig::decode_slurp(&output.stdout)?;
        Ok(match &request.public_address {
            Some(address) => kubeconfig::rewrite_server(&raw, address),
            None => raw,
        })
    }
}

#[async_trait]
impl PlaybookRunner for AnsibleRunner {
    async fn run(
        &self,
        request: &RunRequest,
        tracker: &ProgressTracker,
    ) -> orchestrator_shared_types::Result<RunOutcome> {
        let span = tool_span!("ansible-runner", tracker.cluster_id(), request.kind.config_key());
        self.execute(request, tracker).instrument(span).await
    }

    async fn fetch_kubeconfig(&self, request: &KubeconfigRequest) -> orchestrator_shared_types::Result<String> {
        let kubeconfig = self.slurp_admin_conf(request).await?;
        info!(master = %request.master, "Fetched admin kubeconfig");
        Ok(kubeconfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::{MarkerTable, PlaybookKind};
    use orchestrator_shared_types::{Phase, TaskState};
    use serde_json::Map;
    use state_store_interface::in_memory::InMemoryStateStore;
    use std::path::{Path, PathBuf};

    #[cfg(unix)]
    async fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n")).await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();
        path.to_string_lossy().into_owned()
    }

    fn request(dir: &Path) -> RunRequest {
        RunRequest {
            kind: PlaybookKind::Cluster,
            playbook: "cluster.yml".into(),
            project_dir: dir.join("playbooks"),
            private_data_dir: dir.join("runner"),
            inventory: dir.join("hosts"),
            ssh_key: None,
            limit_hosts: vec!["c1-node-3".into()],
            extra_vars: Map::new(),
            log_file: dir.join("ansible_debug.log"),
            markers: MarkerTable::default_for(PlaybookKind::Cluster),
        }
    }

    const EVENTS: &str = r#"echo "$@" > args.txt
echo '{"event":"playbook_on_start","event_data":{}}'
echo '{"event":"runner_on_ok","event_data":{"task":"etcd : Configure | Check if etcd cluster is healthy","host":"c1-master-1"}}'
echo 'not an event'
echo '{"event":"runner_on_ok","event_data":{"task":"kubernetes/kubeadm : Join to cluster","host":"c1-node-3"}}'"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_advances_phases() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tools = ToolsConfig::default();
        tools.ansible_runner = script(dir.path(), "ansible-runner", EVENTS).await;
        let runner = AnsibleRunner::new(tools);
        let store = Arc::new(InMemoryStateStore::new());
        let tracker = ProgressTracker::new(store, "t1", uuid::Uuid::new_v4());

        let req = request(dir.path());
        let outcome = runner.run(&req, &tracker).await.unwrap();
        assert!(outcome.ok);

        let records = tracker.records().await.unwrap();
        let phases: Vec<_> = records.iter().map(|r| r.msg.as_str()).collect();
        assert_eq!(phases, vec!["prepare runtime", "deploy etcd", "deploy workers"]);
        assert_eq!(records[0].state, TaskState::Success);
        assert_eq!(tracker.current_phase().await, Some(Phase::DeployWorkers));

        let args = tokio::fs::read_to_string(dir.path().join("args.txt")).await.unwrap();
        assert!(args.contains("--limit c1-node-3"));
        assert!(args.contains("-p cluster.yml"));
        assert!(dir.path().join("runner/env/extravars").exists());
        let log = tokio::fs::read_to_string(&req.log_file).await.unwrap();
        assert!(log.contains("not an event"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_closes_phase() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tools = ToolsConfig::default();
        tools.ansible_runner = script(
            dir.path(),
            "ansible-runner",
            r#"echo '{"event":"runner_on_failed","event_data":{"task":"container-engine : Install","host":"c1-node-1","res":{"msg":"No package matching"}}}'
exit 2"#,
        )
        .await;
        let runner = AnsibleRunner::new(tools);
        let store = Arc::new(InMemoryStateStore::new());
        let tracker = ProgressTracker::new(store, "t1", uuid::Uuid::new_v4());

        let outcome = runner.run(&request(dir.path()), &tracker).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.message, "container-engine : Install on c1-node-1: No package matching");
        let records = tracker.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, TaskState::Failed);
        assert_eq!(records[0].detail, outcome.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_kubeconfig_rewrites_server() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tools = ToolsConfig::default();
        // base64 of "server: https://10.0.0.5:6443\n"
        tools.ansible = script(
            dir.path(),
            "ansible",
            r#"echo 'c1-master-1 | SUCCESS => {'
echo '    "changed": false,'
echo '    "content": "c2VydmVyOiBodHRwczovLzEwLjAuMC41OjY0NDMK",'
echo '    "encoding": "base64"'
echo '}'"#,
        )
        .await;
        let runner = AnsibleRunner::new(tools);
        let req = KubeconfigRequest {
            inventory: PathBuf::from("hosts"),
            master: "c1-master-1".into(),
            ssh_key: None,
            user: "ubuntu".into(),
            working_dir: dir.path().to_path_buf(),
            public_address: Some("203.0.113.20".into()),
        };
        let conf = runner.fetch_kubeconfig(&req).await.unwrap();
        assert_eq!(conf, "server: https://203.0.113.20:6443\n");
    }
}
