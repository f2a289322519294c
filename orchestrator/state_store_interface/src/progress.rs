//! Durable per-phase progress records for one running task.
//!
//! A tracker owns at most one open record at a time. Opening a phase closes
//! the previous one as `success` with the same timestamp, so the records of a
//! task form a gap-free, non-overlapping sequence.

use chrono::Utc;
use orchestrator_shared_types::{ClusterId, Phase, Result, TaskState, Taskinfo};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::StateStore;

pub struct ProgressTracker {
    store: Arc<dyn StateStore>,
    task_id: String,
    cluster_id: ClusterId,
    open: Mutex<Option<Taskinfo>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn StateStore>, task_id: impl Into<String>, cluster_id: ClusterId) -> Self {
        Self {
            store,
            task_id: task_id.into(),
            cluster_id,
            open: Mutex::new(None),
        }
    }

    /// Attach to a task that may already have an open record, e.g. from the
    /// soft-timeout handler after the workflow future was dropped.
    pub async fn resume(
        store: Arc<dyn StateStore>,
        task_id: impl Into<String>,
        cluster_id: ClusterId,
    ) -> Result<Self> {
        let task_id = task_id.into();
        let open = store
            .list_taskinfos(&task_id)
            .await?
            .into_iter()
            .rev()
            .find(Taskinfo::is_open);
        Ok(Self {
            store,
            task_id,
            cluster_id,
            open: Mutex::new(open),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Phase of the currently open record, if any.
    pub async fn current_phase(&self) -> Option<Phase> {
        let open = self.open.lock().await;
        open.as_ref().and_then(|info| info.msg.parse().ok())
    }

    /// Open `phase`, closing any other open record as `success` first.
    ///
    /// Beginning the phase that is already open is a no-op. Beginning a phase
    /// that was recorded earlier for the same task rewrites that record.
    pub async fn begin(&self, phase: Phase) -> Result<()> {
        let mut open = self.open.lock().await;
        if let Some(current) = open.as_ref() {
            if current.msg == phase.as_str() {
                return Ok(());
            }
        }

        let now = Utc::now();
        if let Some(mut previous) = open.take() {
            previous.state = TaskState::Success;
            previous.end_time = Some(now);
            self.store.upsert_taskinfo(previous.clone()).await?;
            debug!(task_id = %self.task_id, phase = %previous.msg, "Phase closed");
        }

        let record = Taskinfo::open(&self.task_id, self.cluster_id, phase, now);
        self.store.upsert_taskinfo(record.clone()).await?;
        info!(task_id = %self.task_id, cluster_id = %self.cluster_id, phase = %phase, "Phase started");
        *open = Some(record);
        Ok(())
    }

    /// Close the open record as `success`.
    pub async fn succeed(&self) -> Result<()> {
        self.close(TaskState::Success, String::new()).await
    }

    /// Close the open record as `failed` with `detail`.
    pub async fn fail(&self, detail: impl Into<String>) -> Result<()> {
        self.close(TaskState::Failed, detail.into()).await
    }

    async fn close(&self, state: TaskState, detail: String) -> Result<()> {
        let mut open = self.open.lock().await;
        let Some(mut record) = open.take() else {
            if state == TaskState::Failed {
                warn!(task_id = %self.task_id, detail = %detail, "Failure reported with no open phase");
            }
            return Ok(());
        };
        record.state = state;
        record.end_time = Some(Utc::now());
        record.detail = detail;
        self.store.upsert_taskinfo(record.clone()).await?;
        info!(task_id = %self.task_id, phase = %record.msg, state = %state, "Phase closed");
        Ok(())
    }

    /// Every record of this task ordered by start time.
    pub async fn records(&self) -> Result<Vec<Taskinfo>> {
        self.store.list_taskinfos(&self.task_id).await
    }
}
