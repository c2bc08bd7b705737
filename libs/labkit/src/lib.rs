#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! `LabKit` orchestration core.
//!
//! Modules (hardware drivers, logic, gui panels) are defined from a configuration tree,
//! instantiated from a plugin registry or through a remote connector, wired together by
//! typed connectors and started in dependency order by the [`Manager`].

pub mod config;
pub mod connector;
pub mod context;
pub mod contracts;
pub mod descriptor;
pub mod events;
pub mod manager;
pub mod plugins;
pub mod remote;
pub mod resolver;
pub mod status;
pub mod thread_manager;

pub use config::{ConfigError, ConfigTree, GlobalConfig, RemoteServerConfig};
pub use connector::{Connector, ConnectorDecl, ConnectorError, Connectors};
pub use context::{ModuleCtx, OptionsError};
pub use contracts::{Module, ModuleInit, StatusVariables};
pub use descriptor::{ModuleBase, ModuleDescriptor, ModuleId};
pub use events::ManagerEvent;
pub use manager::{
    ConfigureReport, Manager, ManagerBuilder, ManagerError, ModuleState, QuitOutcome,
    StopReport,
};
pub use plugins::{ModuleClass, ModuleRegistration, PluginError, PluginRegistry};
pub use remote::{RemoteModuleConnector, RemoteUrl, TlsFiles};
pub use resolver::ResolveError;
pub use thread_manager::{ThreadError, ThreadManager};

pub use inventory;
