//! Waiting for freshly provisioned hosts to accept connections.
//!
//! `ReachabilityProber` repeats a bulk ping through the shared retry utility:
//! with `max_wait = T` and `interval = I` it makes at most `floor(T / I)`
//! retries after the first attempt. Each ping is cut off at `T + I` after the
//! probe started, so the probe gives up within `T + I` however slowly the
//! hosts answer.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use infra_provisioner::diagnostics::strip_ansi;
use infra_provisioner::process::ToolCommand;
use infra_provisioner::HostInventory;
use observability::operation_span;
use orchestrator_shared_types::retry::{poll_until, Attempt, RetryPolicy};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::{Result, RunnerError};

/// Inputs of one bulk ping.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest {
    pub inventory: PathBuf,
    pub key_file: Option<PathBuf>,
    pub user: String,
    pub working_dir: PathBuf,
    /// `connection_check.log`; every attempt is appended.
    pub log_file: PathBuf,
}

/// Hosts that answered, per the tool's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingReport {
    pub reachable: BTreeSet<String>,
}

impl PingReport {
    pub fn parse(output: &str) -> Self {
        let reachable = output
            .lines()
            .filter_map(|line| {
                let line = strip_ansi(line);
                let (host, rest) = line.split_once(" | ")?;
                rest.trim_start()
                    .starts_with("SUCCESS")
                    .then(|| host.trim().to_string())
            })
            .collect();
        PingReport { reachable }
    }

    /// Hosts of `expected` that did not answer, in order.
    pub fn missing(&self, expected: &[String]) -> Vec<String> {
        expected
            .iter()
            .filter(|h| !self.reachable.contains(*h))
            .cloned()
            .collect()
    }
}

#[async_trait]
pub trait PingCheck: Send + Sync {
    /// Ping `hosts` once and report which of them answered.
    async fn ping(&self, request: &PingRequest, hosts: &[String]) -> Result<PingReport>;
}

/// `ansible all -m ping -o` against the cluster inventory.
pub struct AnsiblePing {
    ansible: String,
    timeout: Duration,
}

impl AnsiblePing {
    pub fn new(ansible: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ansible: ansible.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PingCheck for AnsiblePing {
    async fn ping(&self, request: &PingRequest, hosts: &[String]) -> Result<PingReport> {
        let mut cmd = ToolCommand::new(&self.ansible)
            .arg("all")
            .arg("-i")
            .arg(request.inventory.to_string_lossy())
            .args(["-m", "ping", "-o", "-u", request.user.as_str()])
            .arg("--limit")
            .arg(hosts.join(","))
            .current_dir(&request.working_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_FORCE_COLOR", "0");
        if let Some(key) = &request.key_file {
            cmd = cmd.arg("--private-key").arg(key.to_string_lossy());
        }
        let mut running = cmd.stream_to(&request.log_file).await?;
        // Per-host failures show up as a non-zero exit; only the output matters.
        let output = tokio::time::timeout(self.timeout, async {
            while running.next_line().await?.is_some() {}
            running.finish().await
        })
        .await
        .map_err(|_| {
            RunnerError::Tool(infra_provisioner::process::ToolError::Timeout {
                command: cmd.display(),
                timeout: self.timeout,
            })
        })??;
        Ok(PingReport::parse(&output.stdout))
    }
}

pub struct ReachabilityProber {
    ping: Arc<dyn PingCheck>,
}

impl ReachabilityProber {
    pub fn new(ping: Arc<dyn PingCheck>) -> Self {
        Self { ping }
    }

    /// Ping every host of `inventory` until all answer or `max_wait` runs out.
    pub async fn probe(
        &self,
        inventory: &HostInventory,
        request: &PingRequest,
        max_wait: Duration,
        interval: Duration,
    ) -> Result<()> {
        let expected = inventory.host_names();
        let policy = RetryPolicy::for_duration(max_wait, interval);
        let deadline = Instant::now() + max_wait + interval;

        let result = poll_until(&policy, "reachability", |attempt| {
            let expected = &expected;
            async move {
                let budget = deadline.saturating_duration_since(Instant::now());
                let Ok(outcome) = tokio::time::timeout(budget, self.ping.ping(request, expected)).await else {
                    warn!(attempt, budget = ?budget, "Ping did not finish in the remaining wait");
                    return Attempt::Pending(expected.clone());
                };
                match outcome {
                    Ok(report) => {
                        let missing = report.missing(expected);
                        if missing.is_empty() {
                            Attempt::Done(Ok(()))
                        } else {
                            warn!(attempt, unreachable = ?missing, "Hosts not reachable yet");
                            Attempt::Pending(missing)
                        }
                    }
                    Err(err) => Attempt::Done(Err(err)),
                }
            }
        })
        .instrument(operation_span!("reachability", hosts = expected.len()))
        .await;

        match result {
            Ok(done) => {
                done?;
                info!(hosts = expected.len(), "All hosts reachable");
                Ok(())
            }
            Err(exhausted) => Err(RunnerError::Unreachable {
                retries: exhausted.retries(),
                elapsed: exhausted.elapsed,
                hosts: exhausted.last,
            }),
        }
    }
}
