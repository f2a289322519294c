//! Subscriber installation for the worker process.

use std::fmt;

use tracing::Level;
use tracing_subscriber::{
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Dependencies whose debug output drowns the workflow logs.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Line format written to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines with the span context prefixed.
    #[default]
    Pretty,
    /// One JSON object per line, the current span's fields flattened in.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub level: Level,
    pub format: LogFormat,
    /// Log span close events with their busy time. Useful when timing phases.
    pub span_timings: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "provisiond".to_string(),
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_timings: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.format = if json { LogFormat::Json } else { LogFormat::Pretty };
        self
    }

    pub fn with_span_timings(mut self, enabled: bool) -> Self {
        self.span_timings = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    ///
    /// HTTP and TLS internals stay at `warn` unless the level asks for
    /// `trace`.
    fn directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_ascii_lowercase()];
        if self.level < Level::TRACE {
            directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
        }
        directives.join(",")
    }

    fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_timings {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Parse a level name from configuration ("info", "DEBUG", ...).
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

/// Install the global subscriber. Fails if one is already installed.
///
/// ```no_run
/// use observability::{init_tracing, TracingConfig};
/// use tracing::Level;
///
/// init_tracing(TracingConfig::new("provisiond").with_level(Level::DEBUG)).ok();
/// ```
pub fn init_tracing(config: TracingConfig) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(config.build_filter());

    match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_span_events(config.span_events())
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_span_events(config.span_events())
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        format = %config.format,
        "Logging ready"
    );
    Ok(())
}

/// Span for an internal operation that is neither a workflow nor a tool run.
#[macro_export]
macro_rules! operation_span {
    ($name:expr) => {
        tracing::info_span!($name)
    };
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}

/// Span wrapping one queue execution of a lifecycle workflow.
#[macro_export]
macro_rules! workflow_span {
    ($task:expr, $cluster_id:expr, $task_id:expr) => {
        tracing::info_span!(
            "workflow",
            task = $task,
            cluster_id = %$cluster_id,
            task_id = %$task_id
        )
    };
}

/// Span around one external tool invocation.
#[macro_export]
macro_rules! tool_span {
    ($tool:expr, $cluster_id:expr) => {
        tracing::info_span!("tool", tool = $tool, cluster_id = %$cluster_id)
    };
    ($tool:expr, $cluster_id:expr, $action:expr) => {
        tracing::info_span!(
            "tool",
            tool = $tool,
            cluster_id = %$cluster_id,
            action = $action
        )
    };
}
