//! The "defined" tier: adding, replacing, reconfiguring and removing module descriptors.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::ConfigTree;
use crate::descriptor::{ModuleBase, ModuleDescriptor, ModuleId};
use crate::events::ManagerEvent;
use crate::manager::{ConfigureReport, Manager, ManagerError};

impl Manager {
    /// Parse one configuration leaf and define the module.
    ///
    /// # Errors
    /// Returns `ManagerError::Descriptor` for malformed leaves and
    /// `ManagerError::AlreadyDefined` if the base already has a module of that name.
    pub fn add_module(
        &self,
        base: ModuleBase,
        name: &str,
        leaf: &Value,
    ) -> Result<ModuleId, ManagerError> {
        let desc = ModuleDescriptor::from_config(base, name, leaf)?;
        self.add_descriptor(desc)
    }

    /// Define a module from an already built descriptor.
    ///
    /// The same name in another base is accepted with a warning; connections naming it
    /// become ambiguous and fail at resolution time.
    ///
    /// # Errors
    /// Returns `ManagerError::Descriptor` for an invalid descriptor and
    /// `ManagerError::AlreadyDefined` on a collision within the same base.
    pub fn add_descriptor(&self, desc: ModuleDescriptor) -> Result<ModuleId, ManagerError> {
        desc.validate()?;
        let id = desc.id();
        let desc = Arc::new(desc);
        let other_bases = self.with_tree(|t| {
            if t.defined.contains(&id) {
                return Err(ManagerError::AlreadyDefined { module: id.clone() });
            }
            let others = t.defined.bases_of(&id.name);
            t.defined.insert(&id, Arc::clone(&desc));
            Ok(others)
        })?;

        if !other_bases.is_empty() {
            tracing::warn!(
                module = %id,
                other_bases = ?other_bases,
                "Module name is defined in several bases; connections to it are ambiguous"
            );
        }
        tracing::info!(module = %id, remote = desc.is_remote(), "Module defined");
        self.publish(ManagerEvent::ModuleAdded(id.clone()));

        if desc.remote_access
            && let Err(e) = self.share_module(&id)
        {
            tracing::warn!(module = %id, error = %e, "Remote access requested but sharing failed");
        }
        Ok(id)
    }

    /// Define a module, first removing any module of the same base and name.
    /// Persisted status variables of the replaced module are kept.
    ///
    /// # Errors
    /// Returns any error from removing the old definition.
    pub fn replace_module(&self, desc: ModuleDescriptor) -> Result<ModuleId, ManagerError> {
        desc.validate()?;
        let id = desc.id();
        if self.is_defined(&id) {
            self.undefine(&id, false)?;
        }
        self.add_descriptor(desc)
    }

    /// Stop the module and its dependents, unload it, unshare it, delete its status
    /// variables and drop the definition. Modules it depends on keep running.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined`, or the error that kept the module active.
    pub fn remove_module(&self, id: &ModuleId) -> Result<(), ManagerError> {
        self.undefine(id, true)
    }

    fn undefine(&self, id: &ModuleId, clear_app_data: bool) -> Result<(), ManagerError> {
        if !self.is_defined(id) {
            return Err(ManagerError::NotDefined { module: id.clone() });
        }

        if self.is_loaded(id) {
            let report = self.stop_with_dependents(id)?;
            if self.is_active(id) {
                let cause = report
                    .failed
                    .into_iter()
                    .find(|(failed, _)| failed == id)
                    .map_or(ManagerError::Active { module: id.clone() }, |(_, e)| e);
                return Err(cause);
            }
            self.unload_module(id)?;
        }

        self.unshare_module(id);
        if clear_app_data {
            match self.clear_module_app_data(id) {
                Ok(true) => tracing::debug!(module = %id, "Status variables deleted"),
                Ok(false) => {}
                Err(e) => tracing::warn!(module = %id, error = %e, "Cannot delete status variables"),
            }
        }

        self.with_tree(|t| {
            if t.loaded.contains(id) {
                // loaded again by a concurrent start
                return Err(ManagerError::AlreadyLoaded { module: id.clone() });
            }
            t.defined.remove(id);
            Ok(())
        })?;
        self.start_gates.remove(id);
        tracing::info!(module = %id, "Module removed");
        self.publish(ManagerEvent::ModuleRemoved(id.clone()));
        Ok(())
    }

    /// Swap the descriptor of a module that is not active. A loaded instance is
    /// unloaded so the next start picks up the new options and connections.
    ///
    /// # Errors
    /// Returns `ManagerError::Descriptor` for an invalid descriptor,
    /// `ManagerError::NotDefined` for unknown modules and `ManagerError::Active` while the
    /// module is running.
    pub fn reconfigure_module(&self, desc: ModuleDescriptor) -> Result<(), ManagerError> {
        desc.validate()?;
        let id = desc.id();
        let _structural = self.tree.lock();

        let state = self.module_state(&id)?;
        if state.is_some_and(|s| s.is_active()) {
            return Err(ManagerError::Active { module: id });
        }
        if state.is_some() {
            self.unload_module(&id)?;
        }

        let desc = Arc::new(desc);
        self.with_tree(|t| t.defined.insert(&id, Arc::clone(&desc)));

        // share entries point at the replaced descriptor
        self.unshare_module(&id);
        if desc.remote_access
            && let Err(e) = self.share_module(&id)
        {
            tracing::warn!(module = %id, error = %e, "Remote access requested but sharing failed");
        }

        tracing::info!(module = %id, "Module reconfigured");
        self.publish(ManagerEvent::ConfigChanged);
        Ok(())
    }

    /// Ingest a whole configuration tree: store the `global` section and the free-form
    /// top-level keys, then define every module. A bad leaf rejects that module only.
    pub fn configure(&self, config: ConfigTree) -> ConfigureReport {
        let _structural = self.tree.lock();
        let ConfigTree {
            modules,
            global,
            extra,
        } = config;
        self.with_tree(|t| {
            t.global = global;
            t.config = extra;
        });

        let mut report = ConfigureReport::default();
        for (id, leaf) in modules.iter() {
            match self.add_module(id.base, &id.name, leaf) {
                Ok(id) => report.added.push(id),
                Err(e) => {
                    tracing::warn!(module = %id, error = %e, "Rejected module definition");
                    report.rejected.push((id, e));
                }
            }
        }
        tracing::info!(
            added = report.added.len(),
            rejected = report.rejected.len(),
            "Phase: configure"
        );
        self.publish(ManagerEvent::ConfigChanged);
        report
    }

    /// Top-level configuration keys other than the module bases and `global`.
    #[must_use]
    pub fn extra_config(&self) -> Map<String, Value> {
        self.read_tree(|t| t.config.clone())
    }
}
