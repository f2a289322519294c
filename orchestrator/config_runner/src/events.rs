//! ansible-runner job events (`-j`): one JSON object per stdout line.

use serde::Deserialize;
use serde_json::Value;

use infra_provisioner::diagnostics::clean_output;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RunnerEvent {
    pub event: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub event_data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EventData {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub res: Option<Value>,
}

impl RunnerEvent {
    /// `None` for lines that are not job events (runner banners, blank lines).
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Name of the task that just completed successfully on a host.
    pub fn completed_task(&self) -> Option<&str> {
        if self.event == "runner_on_ok" {
            self.event_data.task.as_deref()
        } else {
            None
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.event.as_str(),
            "runner_on_failed" | "runner_on_unreachable"
        ) && !self.ignored()
    }

    fn ignored(&self) -> bool {
        self.event_data
            .res
            .as_ref()
            .and_then(|r| r.get("_ansible_ignore_errors"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Human-readable description of a failure event.
    pub fn failure_summary(&self) -> String {
        let msg = self
            .event_data
            .res
            .as_ref()
            .and_then(|r| r.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| clean_output(&self.stdout));
        format!(
            "{} on {}: {}",
            self.event_data.task.as_deref().unwrap_or("task"),
            self.event_data.host.as_deref().unwrap_or("unknown host"),
            msg
        )
    }
}
