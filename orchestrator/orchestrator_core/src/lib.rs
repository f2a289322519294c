//! Lifecycle workflows and the task queue that drives them.
//!
//! A [`TaskMessage`] names one workflow and its arguments. The
//! [`WorkerPool`] admits it, runs the workflow against a
//! [`WorkflowContext`] under the task's time limits, and reports how it
//! ended. Everything the workflows talk to (state store, provisioner,
//! inventory, playbook runner, ping check, cloud clients) is injected
//! through the context, so tests swap in the mock implementations.

pub mod context;
pub mod queue;
pub mod workflows;

pub use context::WorkflowContext;
pub use queue::{QueueError, Task, TaskMessage, TaskOutcome, TaskReport, WorkerPool, SCHEMA_VERSION};
pub use workflows::{dispatch, on_soft_timeout, SOFT_TIME_LIMIT_MSG};
