//! Progress phases derived from playbook task names.
//!
//! Each playbook kind has an ordered table of marker tasks. When a marker
//! task first completes on any host, the run has entered the marker's phase.
//! Only markers later in the table than the current one are considered, so a
//! phase is never re-entered once the run has moved past it.

use std::collections::BTreeMap;

use engine_config::MarkerOverride;
use orchestrator_shared_types::Phase;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookKind {
    Cluster,
    Scale,
    RemoveNode,
}

impl PlaybookKind {
    /// Key of this kind's table in the `[markers]` configuration section.
    pub fn config_key(&self) -> &'static str {
        match self {
            PlaybookKind::Cluster => "cluster",
            PlaybookKind::Scale => "scale",
            PlaybookKind::RemoveNode => "remove_node",
        }
    }
}

impl std::fmt::Display for PlaybookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.config_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Task name as it appears in `event_data.task`.
    pub task: String,
    pub phase: Phase,
}

impl Marker {
    fn new(task: &str, phase: Phase) -> Self {
        Self {
            task: task.to_string(),
            phase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTable {
    initial: Phase,
    markers: Vec<Marker>,
}

impl MarkerTable {
    pub fn new(initial: Phase, markers: Vec<Marker>) -> Self {
        Self { initial, markers }
    }

    /// Built-in table for `kind`.
    pub fn default_for(kind: PlaybookKind) -> Self {
        match kind {
            PlaybookKind::Cluster => Self::new(
                Phase::PrepareRuntime,
                vec![
                    Marker::new("etcd : Configure | Check if etcd cluster is healthy", Phase::DeployEtcd),
                    Marker::new(
                        "kubernetes/control-plane : Kubeadm | Initialize first master",
                        Phase::DeployControlPlane,
                    ),
                    Marker::new("kubernetes/kubeadm : Join to cluster", Phase::DeployWorkers),
                    Marker::new(
                        "kubernetes-apps/ansible : Kubernetes Apps | Start Resources",
                        Phase::DeployComponents,
                    ),
                ],
            ),
            PlaybookKind::Scale => Self::new(
                Phase::PrepareRuntime,
                vec![Marker::new("kubernetes/kubeadm : Join to cluster", Phase::DeployWorkers)],
            ),
            PlaybookKind::RemoveNode => Self::new(Phase::RemoveFromCluster, Vec::new()),
        }
    }

    /// Built-in table for `kind`, with its markers replaced when the
    /// configuration carries an override for that kind.
    pub fn for_kind(kind: PlaybookKind, overrides: &BTreeMap<String, Vec<MarkerOverride>>) -> Self {
        let mut table = Self::default_for(kind);
        if let Some(custom) = overrides.get(kind.config_key()) {
            table.markers = custom
                .iter()
                .map(|m| Marker {
                    task: m.task.clone(),
                    phase: m.phase,
                })
                .collect();
        }
        table
    }

    /// Phase opened when the run starts.
    pub fn initial(&self) -> Phase {
        self.initial
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn sequencer(&self) -> PhaseSequencer<'_> {
        PhaseSequencer {
            table: self,
            next: 0,
        }
    }
}

/// Walks a `MarkerTable` forward as task completions are observed.
#[derive(Debug)]
pub struct PhaseSequencer<'a> {
    table: &'a MarkerTable,
    /// Index of the first marker not yet passed.
    next: usize,
}

impl PhaseSequencer<'_> {
    /// Record that `task` completed. Returns the phase to open when `task`
    /// is a marker at or after the current position.
    pub fn observe(&mut self, task: &str) -> Option<Phase> {
        let task = task.trim();
        let offset = self.table.markers[self.next..]
            .iter()
            .position(|m| m.task == task)?;
        let index = self.next + offset;
        if offset > 0 {
            debug!(skipped = offset, task = %task, "Markers passed without being observed");
        }
        self.next = index + 1;
        Some(self.table.markers[index].phase)
    }

    /// True once every marker has been passed.
    pub fn finished(&self) -> bool {
        self.next >= self.table.markers.len()
    }
}
