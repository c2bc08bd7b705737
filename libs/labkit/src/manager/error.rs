use crate::connector::ConnectorError;
use crate::descriptor::{DescriptorError, ModuleId};
use crate::manager::ModuleState;
use crate::plugins::PluginError;
use crate::resolver::ResolveError;
use crate::thread_manager::ThreadError;

fn join_errors<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_ids(ids: &[ModuleId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors returned by `Manager` operations. Every variant names the module concerned.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("module '{module}' is not defined")]
    NotDefined { module: ModuleId },

    #[error("module '{module}' is already defined")]
    AlreadyDefined { module: ModuleId },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// A bare module name did not resolve to exactly one defined module.
    #[error(transparent)]
    Lookup(#[from] ResolveError),

    #[error("module '{module}' is not loaded")]
    NotLoaded { module: ModuleId },

    #[error("module '{module}' is already loaded")]
    AlreadyLoaded { module: ModuleId },

    #[error("module '{module}': {source}")]
    Plugin {
        module: ModuleId,
        #[source]
        source: PluginError,
    },

    #[error("failed to load module '{module}': {source}")]
    Load {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' is remote but no remote connector is configured")]
    NoRemoteConnector { module: ModuleId },

    #[error("cannot resolve dependencies of '{module}': {}", join_errors(.errors))]
    Resolution {
        module: ModuleId,
        errors: Vec<ResolveError>,
    },

    #[error("cannot connect module '{module}': {}", join_errors(.errors))]
    Connection {
        module: ModuleId,
        errors: Vec<ConnectorError>,
    },

    #[error("activation of module '{module}' failed: {source}")]
    Activation {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    #[error("deactivation of module '{module}' failed: {source}")]
    Deactivation {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    #[error("worker thread of module '{module}': {source}")]
    Thread {
        module: ModuleId,
        #[source]
        source: ThreadError,
    },

    #[error("module '{module}' is busy")]
    Busy { module: ModuleId },

    #[error("module '{module}' is still used by active modules: {}", join_ids(.dependents))]
    HasActiveDependents {
        module: ModuleId,
        dependents: Vec<ModuleId>,
    },

    #[error("module '{module}' is broken; reload it first")]
    Broken { module: ModuleId },

    #[error("module '{module}' is active; deactivate it first")]
    Active { module: ModuleId },

    #[error("module '{module}' cannot go from {from} to {to}")]
    InvalidTransition {
        module: ModuleId,
        from: ModuleState,
        to: ModuleState,
    },

    #[error("module '{module}' cannot be shared: {reason}")]
    Share { module: ModuleId, reason: String },

    #[error(
        "start aborted at module '{failed}' (already running: [{}]): {source}",
        join_ids(.started)
    )]
    StartAborted {
        failed: ModuleId,
        /// Modules activated by this call before the failure. They are left running.
        started: Vec<ModuleId>,
        #[source]
        source: Box<ManagerError>,
    },
}

impl ManagerError {
    /// Module the error is about. For an aborted start, the module that failed.
    #[must_use]
    pub fn module(&self) -> Option<&ModuleId> {
        match self {
            ManagerError::Descriptor(_) | ManagerError::Lookup(_) => None,
            ManagerError::NotDefined { module }
            | ManagerError::AlreadyDefined { module }
            | ManagerError::NotLoaded { module }
            | ManagerError::AlreadyLoaded { module }
            | ManagerError::Plugin { module, .. }
            | ManagerError::Load { module, .. }
            | ManagerError::NoRemoteConnector { module }
            | ManagerError::Resolution { module, .. }
            | ManagerError::Connection { module, .. }
            | ManagerError::Activation { module, .. }
            | ManagerError::Deactivation { module, .. }
            | ManagerError::Thread { module, .. }
            | ManagerError::Busy { module }
            | ManagerError::HasActiveDependents { module, .. }
            | ManagerError::Broken { module }
            | ManagerError::Active { module }
            | ManagerError::InvalidTransition { module, .. }
            | ManagerError::Share { module, .. } => Some(module),
            ManagerError::StartAborted { failed, .. } => Some(failed),
        }
    }

    /// Innermost error, looking through `StartAborted`.
    #[must_use]
    pub fn root(&self) -> &ManagerError {
        match self {
            ManagerError::StartAborted { source, .. } => source.root(),
            other => other,
        }
    }
}
