#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Process bootstrap for `LabKit` hosts: layered application config, logging,
//! home-directory resolution and shutdown signals.

pub mod config;
pub mod logging;
pub mod paths;
pub mod signals;

pub use config::{AppConfig, CliArgs, LogFormat, LoggingConfig, ServerConfig, ThreadsConfig};
pub use logging::init_logging;
pub use paths::{HomeDirError, expand_tilde, resolve_home_dir};
pub use signals::{ShutdownSignal, wait_for_shutdown};
