//! Scripted runner and ping check for workflow tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use state_store_interface::ProgressTracker;

use crate::reachability::{PingCheck, PingReport, PingRequest};
use crate::{KubeconfigRequest, PlaybookRunner, Result, RunOutcome, RunRequest};

pub const MOCK_KUBECONFIG: &str = "apiVersion: v1\nclusters:\n- cluster:\n    server: https://10.0.0.5:6443\n";

/// Runner that walks the request's marker table as if every marker task had
/// completed, then succeeds or fails as configured.
#[derive(Clone, Default)]
pub struct MockRunner {
    requests: Arc<Mutex<Vec<RunRequest>>>,
    failure: Option<String>,
    kubeconfig_error: Option<String>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn failing_kubeconfig(mut self, message: impl Into<String>) -> Self {
        self.kubeconfig_error = Some(message.into());
        self
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PlaybookRunner for MockRunner {
    async fn run(
        &self,
        request: &RunRequest,
        tracker: &ProgressTracker,
    ) -> orchestrator_shared_types::Result<RunOutcome> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        tracker.begin(request.markers.initial()).await?;
        let mut sequencer = request.markers.sequencer();
        for marker in request.markers.markers() {
            if let Some(phase) = sequencer.observe(&marker.task) {
                tracker.begin(phase).await?;
            }
        }

        match &self.failure {
            Some(message) => {
                tracker.fail(message).await?;
                Ok(RunOutcome {
                    ok: false,
                    message: message.clone(),
                })
            }
            None => Ok(RunOutcome {
                ok: true,
                message: String::new(),
            }),
        }
    }

    async fn fetch_kubeconfig(&self, request: &KubeconfigRequest) -> orchestrator_shared_types::Result<String> {
        if let Some(message) = &self.kubeconfig_error {
            return Err(crate::RunnerError::Kubeconfig(message.clone()).into());
        }
        Ok(match &request.public_address {
            Some(address) => crate::kubeconfig::rewrite_server(MOCK_KUBECONFIG, address),
            None => MOCK_KUBECONFIG.to_string(),
        })
    }
}

/// Ping check where every host answers except the configured ones, and
/// nothing answers before the configured attempt.
#[derive(Default)]
pub struct MockPing {
    calls: AtomicU32,
    never: BTreeSet<String>,
    first_success: u32,
    latency: Option<std::time::Duration>,
}

impl MockPing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn never_reachable<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.never.extend(hosts.into_iter().map(Into::into));
        self
    }

    /// No host answers before attempt `attempt` (1-based).
    pub fn reachable_after(mut self, attempt: u32) -> Self {
        self.first_success = attempt;
        self
    }

    /// Every ping takes `latency` before reporting.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PingCheck for MockPing {
    async fn ping(&self, _request: &PingRequest, hosts: &[String]) -> Result<PingReport> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if attempt < self.first_success {
            return Ok(PingReport::default());
        }
        Ok(PingReport {
            reachable: hosts
                .iter()
                .filter(|h| !self.never.contains(*h))
                .cloned()
                .collect(),
        })
    }
}
