//! Module manager: the explicit context object that owns the bookkeeping tree.
//!
//! Construct one per process with [`Manager::builder`] and pass the returned `Arc`
//! to every component that needs it.
//!
//! All reads and writes of the tree go through a single `parking_lot::ReentrantMutex`.
//! Structural operations that span several steps (bulk configuration, removal) hold
//! the lock for the whole operation and re-enter it from the helpers they call. The
//! lock is never held while module code runs or while a remote connection is opened.
//! Starting one module is additionally serialized per module, so two callers racing to
//! start it end up with one activation and one no-op.

mod definitions;
mod error;
mod lifecycle;
mod plans;
mod state;
mod tree;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use error::ManagerError;
pub use plans::{ConfigureReport, QuitOutcome, StopReport};
pub use state::ModuleState;

use crate::config::GlobalConfig;
use crate::contracts::{Module, StatusVariables};
use crate::descriptor::{ModuleDescriptor, ModuleId};
use crate::events::{EventBus, ManagerEvent};
use crate::plugins::PluginRegistry;
use crate::remote::{RemoteModuleConnector, ShareTable};
use crate::resolver::{self, ResolveError};
use crate::status::{StatusError, StatusStore};
use crate::thread_manager::{DEFAULT_JOIN_TIMEOUT, ThreadManager};

use tree::BookkeepingTree;

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    plugins: PluginRegistry,
    status_dir: PathBuf,
    join_timeout: Duration,
    remote: Option<Arc<dyn RemoteModuleConnector>>,
    event_capacity: Option<usize>,
    instance_id: Option<Uuid>,
}

impl ManagerBuilder {
    /// Directory holding status-variable files.
    #[must_use]
    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = dir.into();
        self
    }

    /// Status files under `<home>/app_status`.
    #[must_use]
    pub fn with_home_dir(self, home: &Path) -> Self {
        let store = StatusStore::under_home(home);
        self.with_status_dir(store.dir())
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_remote_connector(mut self, connector: Arc<dyn RemoteModuleConnector>) -> Self {
        self.remote = Some(connector);
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_instance_id(mut self, id: Uuid) -> Self {
        self.instance_id = Some(id);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Manager> {
        let instance_id = self.instance_id.unwrap_or_else(Uuid::new_v4);
        tracing::info!(
            instance_id = %instance_id,
            classes = self.plugins.len(),
            status_dir = %self.status_dir.display(),
            "Module manager created"
        );
        Arc::new(Manager {
            tree: ReentrantMutex::new(RefCell::new(BookkeepingTree::default())),
            plugins: self.plugins,
            threads: ThreadManager::new(),
            status: StatusStore::new(self.status_dir),
            shares: ShareTable::new(),
            remote: self.remote,
            events: self
                .event_capacity
                .map_or_else(EventBus::default, EventBus::with_capacity),
            join_timeout: self.join_timeout,
            instance_id,
            start_gates: DashMap::new(),
        })
    }
}

/// Owner of the bookkeeping tree and entry point of every lifecycle operation.
pub struct Manager {
    tree: ReentrantMutex<RefCell<BookkeepingTree>>,
    plugins: PluginRegistry,
    threads: ThreadManager,
    status: StatusStore,
    shares: ShareTable,
    remote: Option<Arc<dyn RemoteModuleConnector>>,
    events: EventBus,
    join_timeout: Duration,
    instance_id: Uuid,
    /// Serializes concurrent starts of the same module.
    start_gates: DashMap<ModuleId, Arc<ReentrantMutex<()>>>,
}

impl Manager {
    #[must_use]
    pub fn builder(plugins: PluginRegistry) -> ManagerBuilder {
        ManagerBuilder {
            plugins,
            status_dir: PathBuf::from(crate::status::STATUS_DIR_NAME),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            remote: None,
            event_capacity: None,
            instance_id: None,
        }
    }

    /// Run `f` with exclusive access to the tree. `f` must not call back into the manager.
    fn with_tree<R>(&self, f: impl FnOnce(&mut BookkeepingTree) -> R) -> R {
        let guard = self.tree.lock();
        let mut tree = guard.borrow_mut();
        f(&mut tree)
    }

    fn read_tree<R>(&self, f: impl FnOnce(&BookkeepingTree) -> R) -> R {
        let guard = self.tree.lock();
        let tree = guard.borrow();
        f(&tree)
    }

    fn publish(&self, event: ManagerEvent) {
        self.events.publish(event);
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    #[must_use]
    pub fn status_store(&self) -> &StatusStore {
        &self.status
    }

    #[must_use]
    pub fn global_config(&self) -> GlobalConfig {
        self.read_tree(|t| t.global.clone())
    }

    // --- queries -----------------------------------------------------------------

    #[must_use]
    pub fn is_defined(&self, id: &ModuleId) -> bool {
        self.read_tree(|t| t.defined.contains(id))
    }

    #[must_use]
    pub fn is_loaded(&self, id: &ModuleId) -> bool {
        self.read_tree(|t| t.loaded.contains(id))
    }

    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules.
    pub fn descriptor(&self, id: &ModuleId) -> Result<Arc<ModuleDescriptor>, ManagerError> {
        self.read_tree(|t| t.descriptor(id))
    }

    /// Resolve a bare module name across all bases.
    ///
    /// # Errors
    /// Returns `ResolveError` if the name is unknown or defined in several bases.
    pub fn find_module(&self, name: &str) -> Result<ModuleId, ResolveError> {
        self.read_tree(|t| resolver::find_by_name(&t.defined, name))
    }

    /// `None` if the module is defined but not loaded.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules.
    pub fn module_state(&self, id: &ModuleId) -> Result<Option<ModuleState>, ManagerError> {
        let snapshot = self.read_tree(|t| {
            if !t.defined.contains(id) {
                return Err(ManagerError::NotDefined { module: id.clone() });
            }
            Ok(t.loaded.get(id).map(tree::LoadedModule::snapshot))
        })?;
        Ok(snapshot.map(tree::reported_state))
    }

    /// State of every defined module; `None` for modules that are not loaded.
    #[must_use]
    pub fn module_states(&self) -> Vec<(ModuleId, Option<ModuleState>)> {
        let snapshots: Vec<_> = self.read_tree(|t| {
            t.defined
                .ids()
                .map(|id| {
                    let snapshot = t.loaded.get(&id).map(tree::LoadedModule::snapshot);
                    (id, snapshot)
                })
                .collect()
        });
        snapshots
            .into_iter()
            .map(|(id, snapshot)| (id, snapshot.map(tree::reported_state)))
            .collect()
    }

    #[must_use]
    pub fn is_active(&self, id: &ModuleId) -> bool {
        matches!(self.module_state(id), Ok(Some(s)) if s.is_active())
    }

    /// Live instance of a loaded module.
    ///
    /// # Errors
    /// Returns `ManagerError::NotLoaded` if the module has no instance.
    pub fn instance(&self, id: &ModuleId) -> Result<Arc<dyn Module>, ManagerError> {
        self.read_tree(|t| {
            t.loaded
                .get(id)
                .map(|m| Arc::clone(&m.instance))
                .ok_or_else(|| ManagerError::NotLoaded { module: id.clone() })
        })
    }

    #[must_use]
    pub fn defined_modules(&self) -> Vec<ModuleId> {
        self.read_tree(|t| t.defined.ids().collect())
    }

    #[must_use]
    pub fn loaded_modules(&self) -> Vec<ModuleId> {
        self.read_tree(|t| t.loaded.ids().collect())
    }

    #[must_use]
    pub fn active_modules(&self) -> Vec<ModuleId> {
        self.read_tree(|t| {
            t.loaded
                .iter()
                .filter(|(_, m)| m.state == ModuleState::Active)
                .map(|(id, _)| id)
                .collect()
        })
    }

    // --- sharing -----------------------------------------------------------------

    /// Expose a defined module to remote peers under its name.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules and `ManagerError::Share`
    /// if another module is already shared under the same name.
    pub fn share_module(&self, id: &ModuleId) -> Result<(), ManagerError> {
        let desc = self.descriptor(id)?;
        self.shares
            .share(&desc)
            .map_err(|e| ManagerError::Share {
                module: id.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(module = %id, "Module shared for remote access");
        self.publish(ManagerEvent::ModuleShared(id.clone()));
        Ok(())
    }

    /// Returns whether a share record was removed.
    pub fn unshare_module(&self, id: &ModuleId) -> bool {
        let owned = self
            .shares
            .get(&id.name)
            .is_some_and(|desc| desc.base == id.base);
        if owned && self.shares.unshare(&id.name) {
            tracing::info!(module = %id, "Module unshared");
            self.publish(ManagerEvent::ModuleUnshared(id.clone()));
            return true;
        }
        false
    }

    /// Defined module shared under `name`, if any.
    #[must_use]
    pub fn shared_module(&self, name: &str) -> Option<ModuleId> {
        self.shares.get(name).map(|d| d.id())
    }

    #[must_use]
    pub fn shared_module_names(&self) -> Vec<String> {
        self.shares.names()
    }

    // --- status variables --------------------------------------------------------

    fn class_name_of(&self, id: &ModuleId) -> Result<Option<String>, ManagerError> {
        self.read_tree(|t| {
            if let Some(loaded) = t.loaded.get(id) {
                return Ok(loaded.class_name.clone());
            }
            Ok(t.descriptor(id)?.class_name().map(str::to_owned))
        })
    }

    /// Persisted status variables of a module. Empty for remote modules and when no
    /// file exists yet.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules; a corrupt file is reported
    /// as `ManagerError::Load`.
    pub fn load_module_status_variables(
        &self,
        id: &ModuleId,
    ) -> Result<StatusVariables, ManagerError> {
        let Some(class_name) = self.class_name_of(id)? else {
            return Ok(StatusVariables::new());
        };
        self.status
            .load(&class_name, id.base, &id.name)
            .map_err(|e| status_to_manager(id, e))
    }

    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules and `ManagerError::Load` if
    /// the file cannot be written.
    pub fn save_module_status_variables(
        &self,
        id: &ModuleId,
        vars: &StatusVariables,
    ) -> Result<(), ManagerError> {
        let Some(class_name) = self.class_name_of(id)? else {
            return Ok(());
        };
        self.status
            .save(&class_name, id.base, &id.name, vars)
            .map_err(|e| status_to_manager(id, e))
    }

    /// Whether a status file exists for the module.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules.
    pub fn has_app_data(&self, id: &ModuleId) -> Result<bool, ManagerError> {
        Ok(self
            .class_name_of(id)?
            .is_some_and(|class| self.status.exists(&class, id.base, &id.name)))
    }

    /// Delete the status file of the module. Returns whether one existed.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined` for unknown modules and `ManagerError::Load` if
    /// the file cannot be removed.
    pub fn clear_module_app_data(&self, id: &ModuleId) -> Result<bool, ManagerError> {
        let Some(class_name) = self.class_name_of(id)? else {
            return Ok(false);
        };
        self.status
            .clear(&class_name, id.base, &id.name)
            .map_err(|e| status_to_manager(id, e))
    }
}

fn status_to_manager(id: &ModuleId, e: StatusError) -> ManagerError {
    ManagerError::Load {
        module: id.clone(),
        source: e.into(),
    }
}
