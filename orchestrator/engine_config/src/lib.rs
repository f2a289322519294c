//! Engine configuration for provisiond.
//!
//! Configuration is a single TOML file. Every section has defaults, so an
//! empty file (or no file at all) yields a usable development setup.
//!
//! # Configuration Location
//!
//! - `$PROVISIOND_CONFIG` if set
//! - otherwise `~/.config/provisiond/engine.toml` (XDG config dir)
//!
//! # Example
//!
//! ```no_run
//! use engine_config::EngineConfig;
//!
//! # async fn demo() -> engine_config::Result<()> {
//! let config = EngineConfig::load_default().await?;
//! println!("clusters live under {}", config.paths.clusters_root.display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod paths;
mod error;

pub use config::{
    EngineConfig, InstanceSettings, LimitsConfig, LoggingConfig, MarkerOverride, OpenStackConfig,
    PathsConfig, PlaybookConfig, ReachabilityConfig, SshConfig, TimeLimit, ToolsConfig,
    WorkerConfig,
};
pub use error::{ConfigError, Result};
pub use paths::{default_config_file, ClusterPaths};

/// Application name used for XDG paths
pub const APP_NAME: &str = "provisiond";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PROVISIOND_CONFIG";
