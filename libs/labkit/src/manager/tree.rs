use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::GlobalConfig;
use crate::connector::Connectors;
use crate::contracts::{Module, reports_busy};
use crate::descriptor::{BaseMap, ModuleDescriptor, ModuleId};
use crate::manager::{ManagerError, ModuleState};
use crate::resolver::DefinedModules;
use crate::thread_manager::ThreadHandle;

/// A live instance in the "loaded" tier.
pub(crate) struct LoadedModule {
    pub instance: Arc<dyn Module>,
    pub connectors: Arc<Connectors>,
    /// Class name used for status files. `None` for remote proxies, which keep no local state.
    pub class_name: Option<String>,
    pub threaded: bool,
    pub state: ModuleState,
    pub thread: Option<ThreadHandle>,
}

impl LoadedModule {
    pub fn transition(&mut self, id: &ModuleId, next: ModuleState) -> Result<(), ManagerError> {
        if !self.state.can_transition_to(next) {
            return Err(ManagerError::InvalidTransition {
                module: id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// State and instance, for `reported_state` once the tree lock is released.
    pub fn snapshot(&self) -> (ModuleState, Arc<dyn Module>) {
        (self.state, Arc::clone(&self.instance))
    }
}

/// State as reported to callers: a busy active module shows as locked. Asking a remote
/// proxy whether it is busy goes over the network, so never call this under the tree lock.
pub(crate) fn reported_state((state, instance): (ModuleState, Arc<dyn Module>)) -> ModuleState {
    if state == ModuleState::Active && reports_busy(instance.as_ref()) {
        ModuleState::Locked
    } else {
        state
    }
}

/// Three-tier bookkeeping: free-form config, defined descriptors, loaded instances.
///
/// Every `loaded` entry has a `defined` counterpart; the manager unloads before it
/// undefines.
#[derive(Default)]
pub(crate) struct BookkeepingTree {
    pub global: GlobalConfig,
    pub config: Map<String, Value>,
    pub defined: DefinedModules,
    pub loaded: BaseMap<LoadedModule>,
}

impl BookkeepingTree {
    pub fn descriptor(&self, id: &ModuleId) -> Result<Arc<ModuleDescriptor>, ManagerError> {
        self.defined
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotDefined { module: id.clone() })
    }

    pub fn loaded_mut(&mut self, id: &ModuleId) -> Result<&mut LoadedModule, ManagerError> {
        self.loaded
            .get_mut(id)
            .ok_or_else(|| ManagerError::NotLoaded { module: id.clone() })
    }

    /// Loaded modules with no definition. Always empty outside of bugs.
    pub fn orphans(&self) -> Vec<ModuleId> {
        self.loaded
            .ids()
            .filter(|id| !self.defined.contains(id))
            .collect()
    }
}
