//! Logging setup and span helpers for the provisioning engine.
//!
//! Every workflow runs inside a `workflow` span carrying the task name, the
//! cluster id and the task id, so any line logged by an adapter several
//! layers down can be traced back to the queue message that caused it.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, parse_level, LogFormat, TracingConfig};
