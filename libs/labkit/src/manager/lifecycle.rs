//! Single-module lifecycle steps: load, connect, activate, deactivate, unload.
//!
//! Each step reads what it needs from the tree, releases the lock, runs module or
//! network code, then takes the lock again to record the outcome.

use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::connector::{ConnectorError, Connectors};
use crate::context::ModuleCtx;
use crate::contracts::{Module, ModuleInit, StatusVariables, guarded, reports_busy};
use crate::descriptor::{ModuleBase, ModuleId};
use crate::events::ManagerEvent;
use crate::manager::tree::LoadedModule;
use crate::manager::{Manager, ManagerError, ModuleState};
use crate::remote::TlsFiles;
use crate::resolver;
use crate::thread_manager::ThreadHandle;

/// What `activate_module` needs, copied out of the tree.
struct ActivationInput {
    instance: Arc<dyn Module>,
    connectors: Arc<Connectors>,
    class_name: Option<String>,
    threaded: bool,
    options: Arc<serde_json::Map<String, serde_json::Value>>,
}

impl Manager {
    fn set_state(&self, id: &ModuleId, next: ModuleState) -> Result<(), ManagerError> {
        self.with_tree(|t| t.loaded_mut(id)?.transition(id, next))?;
        self.publish(ManagerEvent::ModuleStateChanged {
            module: id.clone(),
            state: next,
        });
        Ok(())
    }

    /// Instantiate a defined module: from its plugin class, or as a remote proxy when the
    /// descriptor carries a remote url. Remote modules never touch the plugin registry.
    ///
    /// # Errors
    /// Returns `ManagerError::AlreadyLoaded`, `ManagerError::Plugin` for unknown classes,
    /// `ManagerError::NoRemoteConnector` and `ManagerError::Load` for factory or network
    /// failures.
    pub fn load_module(&self, id: &ModuleId) -> Result<(), ManagerError> {
        let desc = self.read_tree(|t| {
            if t.loaded.contains(id) {
                return Err(ManagerError::AlreadyLoaded { module: id.clone() });
            }
            t.descriptor(id)
        })?;

        let loaded = if let Some(url) = &desc.remote_url {
            let connector = self
                .remote
                .as_ref()
                .ok_or_else(|| ManagerError::NoRemoteConnector { module: id.clone() })?;
            let tls = TlsFiles::from_descriptor(&desc);
            tracing::info!(module = %id, remote = %url, "Loading remote module");
            let instance = connector
                .connect(url, tls.as_ref())
                .map_err(|source| ManagerError::Load {
                    module: id.clone(),
                    source,
                })?;
            LoadedModule {
                instance,
                connectors: Arc::new(Connectors::default()),
                class_name: None,
                threaded: false,
                state: ModuleState::Deactivated,
                thread: None,
            }
        } else {
            let class_path = desc.class_path.as_deref().unwrap_or_default();
            let class = self
                .plugins
                .get(id.base, class_path)
                .map_err(|source| ManagerError::Plugin {
                    module: id.clone(),
                    source,
                })?;
            let connectors = Arc::new(Connectors::from_decls(&class.connectors).map_err(
                |e| ManagerError::Connection {
                    module: id.clone(),
                    errors: vec![e],
                },
            )?);
            let init = ModuleInit {
                id: id.clone(),
                options: desc.options.clone(),
                connectors: Arc::clone(&connectors),
            };
            tracing::info!(module = %id, class = %class.class_path, "Loading module");
            let instance =
                guarded(|| (class.factory)(&init)).map_err(|source| ManagerError::Load {
                    module: id.clone(),
                    source,
                })?;
            LoadedModule {
                instance,
                connectors,
                class_name: Some(class.class_name().to_owned()),
                threaded: class.threaded,
                state: ModuleState::Deactivated,
                thread: None,
            }
        };

        self.with_tree(|t| {
            // definition may have been removed or the module loaded by another thread
            if !t.defined.contains(id) {
                return Err(ManagerError::NotDefined { module: id.clone() });
            }
            if t.loaded.contains(id) {
                return Err(ManagerError::AlreadyLoaded { module: id.clone() });
            }
            t.loaded.insert(id, loaded);
            Ok(())
        })?;
        self.publish(ManagerEvent::ModuleLoaded(id.clone()));
        Ok(())
    }

    /// Bind every declared connector against the loaded tier.
    ///
    /// All connectors are tried and every failure is reported. On failure the module is
    /// left unconnected so that no connector points at a target the caller did not accept.
    ///
    /// # Errors
    /// Returns `ManagerError::Connection` listing per-connector errors.
    pub fn connect_module(&self, id: &ModuleId) -> Result<(), ManagerError> {
        let errors = self.with_tree(|t| {
            let desc = t.descriptor(id)?;
            let loaded = t
                .loaded
                .get(id)
                .ok_or_else(|| ManagerError::NotLoaded { module: id.clone() })?;
            match loaded.state {
                ModuleState::Deactivated => {}
                ModuleState::Connected => return Ok(Vec::new()),
                ModuleState::Broken => return Err(ManagerError::Broken { module: id.clone() }),
                other => {
                    return Err(ManagerError::InvalidTransition {
                        module: id.clone(),
                        from: other,
                        to: ModuleState::Connected,
                    });
                }
            }

            let connectors = Arc::clone(&loaded.connectors);
            let mut errors = Vec::new();
            for configured in desc.connections.keys() {
                if connectors.get(configured).is_none() {
                    errors.push(ConnectorError::Unknown {
                        connector: configured.clone(),
                    });
                }
            }

            for connector in connectors.iter() {
                let Some(target_name) = desc.connections.get(connector.name()) else {
                    if !connector.is_optional() {
                        errors.push(ConnectorError::Missing {
                            connector: connector.name().to_owned(),
                        });
                    }
                    continue;
                };
                let unavailable = |reason: String| ConnectorError::TargetUnavailable {
                    connector: connector.name().to_owned(),
                    target: target_name.clone(),
                    reason,
                };
                let target_id = match resolver::find_by_name(&t.defined, target_name) {
                    Ok(target_id) => target_id,
                    Err(e) => {
                        errors.push(unavailable(e.to_string()));
                        continue;
                    }
                };
                let Some(target) = t.loaded.get(&target_id) else {
                    errors.push(unavailable("target is not loaded".to_owned()));
                    continue;
                };
                if target.state == ModuleState::Broken {
                    errors.push(unavailable("target is broken".to_owned()));
                    continue;
                }
                if let Err(e) = connector.connect(&target.instance) {
                    errors.push(e);
                }
            }

            if errors.is_empty() {
                t.loaded_mut(id)?.transition(id, ModuleState::Connected)?;
            } else {
                connectors.disconnect_all();
            }
            Ok(errors)
        })?;

        if errors.is_empty() {
            tracing::debug!(module = %id, "Module connected");
            self.publish(ManagerEvent::ModuleStateChanged {
                module: id.clone(),
                state: ModuleState::Connected,
            });
            Ok(())
        } else {
            for e in &errors {
                tracing::warn!(module = %id, error = %e, "Connector failed");
            }
            Err(ManagerError::Connection {
                module: id.clone(),
                errors,
            })
        }
    }

    /// Run the activation hook of a connected module, on its own worker thread if the
    /// class is threaded. Status variables are restored first.
    ///
    /// Returns `false` if the module was already active.
    ///
    /// # Errors
    /// Returns `ManagerError::Activation` (module is now broken), `ManagerError::Thread`
    /// if the worker cannot be created, or a state error.
    pub fn activate_module(&self, id: &ModuleId) -> Result<bool, ManagerError> {
        let input = self.with_tree(|t| {
            let desc = t.descriptor(id)?;
            let loaded = t.loaded_mut(id)?;
            match loaded.state {
                ModuleState::Active => return Ok(None),
                ModuleState::Broken => return Err(ManagerError::Broken { module: id.clone() }),
                _ => {}
            }
            loaded.transition(id, ModuleState::Activating)?;
            Ok(Some(ActivationInput {
                instance: Arc::clone(&loaded.instance),
                connectors: Arc::clone(&loaded.connectors),
                class_name: loaded.class_name.clone(),
                threaded: loaded.threaded,
                options: Arc::new(desc.options.clone()),
            }))
        })?;
        let Some(input) = input else {
            return Ok(false);
        };
        self.publish(ManagerEvent::ModuleStateChanged {
            module: id.clone(),
            state: ModuleState::Activating,
        });

        let status_variables = match &input.class_name {
            Some(class) => self
                .status
                .load(class, id.base, &id.name)
                .unwrap_or_else(|e| {
                    tracing::warn!(module = %id, error = %e, "Ignoring unreadable status variables");
                    StatusVariables::new()
                }),
            None => StatusVariables::new(),
        };
        let ctx = ModuleCtx::new(
            id.clone(),
            input.options,
            input.connectors,
            status_variables,
        );

        let (outcome, thread) = if input.threaded {
            self.activate_on_thread(id, input.instance, ctx)
        } else {
            let instance = input.instance;
            (guarded(|| instance.on_activate(&ctx)), None)
        };

        match outcome {
            Ok(()) => {
                self.with_tree(|t| {
                    let loaded = t.loaded_mut(id)?;
                    loaded.thread = thread;
                    loaded.transition(id, ModuleState::Active)
                })?;
                tracing::info!(module = %id, "Module activated");
                self.publish(ManagerEvent::ModuleStateChanged {
                    module: id.clone(),
                    state: ModuleState::Active,
                });
                self.publish(ManagerEvent::ModuleActivated(id.clone()));
                Ok(true)
            }
            Err(source) => {
                tracing::error!(module = %id, error = %format!("{source:#}"), "Module activation failed");
                self.mark_broken(id);
                Err(ManagerError::Activation {
                    module: id.clone(),
                    source,
                })
            }
        }
    }

    fn activate_on_thread(
        &self,
        id: &ModuleId,
        instance: Arc<dyn Module>,
        ctx: ModuleCtx,
    ) -> (anyhow::Result<()>, Option<ThreadHandle>) {
        let name = id.thread_name();
        let handle = match self.threads.get_new_thread(&name) {
            Ok(handle) => handle,
            Err(e) => return (Err(e.into()), None),
        };
        let result = self
            .threads
            .invoke_blocking(&handle, move || instance.on_activate(&ctx))
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        if result.is_ok() {
            (result, Some(handle))
        } else {
            self.stop_thread(id, &name);
            (result, None)
        }
    }

    fn stop_thread(&self, id: &ModuleId, name: &str) {
        if let Err(e) = self.threads.quit_thread(name) {
            tracing::debug!(module = %id, error = %e, "Worker already gone");
            return;
        }
        // a join timeout is logged by the thread manager and does not stop teardown
        if let Err(e) = self.threads.join_thread(name, self.join_timeout) {
            tracing::warn!(module = %id, error = %e, "Worker thread not joined");
        }
    }

    fn mark_broken(&self, id: &ModuleId) {
        let thread = self.with_tree(|t| {
            t.loaded.get_mut(id).and_then(|m| {
                m.state = ModuleState::Broken;
                m.thread.take()
            })
        });
        if let Some(thread) = thread {
            self.stop_thread(id, thread.name());
        }
        self.publish(ManagerEvent::ModuleStateChanged {
            module: id.clone(),
            state: ModuleState::Broken,
        });
    }

    /// Active modules whose connectors point at `id`.
    pub(crate) fn active_dependents(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.read_tree(|t| {
            let reverse = resolver::reverse_dependencies(&t.defined, id);
            reverse
                .graph
                .get(id)
                .map(|users| {
                    users
                        .iter()
                        .filter(|u| t.loaded.get(u).is_some_and(|m| m.state.is_active()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Run the deactivation hook, save status variables, stop the worker thread and
    /// unbind connectors.
    ///
    /// A busy module or one still used by active modules is refused unless `force` is set.
    /// Deactivating a module that is not active is a no-op.
    ///
    /// # Errors
    /// Returns `ManagerError::Busy`, `ManagerError::HasActiveDependents`, or
    /// `ManagerError::Deactivation` (the module is then broken, teardown still completes).
    pub fn deactivate_module(&self, id: &ModuleId, force: bool) -> Result<(), ManagerError> {
        let (dependents, busy) = if force {
            (Vec::new(), false)
        } else {
            let snapshot = self.read_tree(|t| t.loaded.get(id).map(LoadedModule::snapshot));
            let busy = snapshot
                .is_some_and(|(state, instance)| {
                    state == ModuleState::Active && reports_busy(instance.as_ref())
                });
            (self.active_dependents(id), busy)
        };

        let taken = self.with_tree(|t| {
            let loaded = t.loaded_mut(id)?;
            match loaded.state {
                ModuleState::Active => {}
                ModuleState::Connected => {
                    loaded.connectors.disconnect_all();
                    loaded.transition(id, ModuleState::Deactivated)?;
                    return Ok(None);
                }
                _ => return Ok(None),
            }
            if busy {
                return Err(ManagerError::Busy { module: id.clone() });
            }
            if !dependents.is_empty() {
                return Err(ManagerError::HasActiveDependents {
                    module: id.clone(),
                    dependents,
                });
            }
            loaded.transition(id, ModuleState::Deactivating)?;
            Ok(Some((
                Arc::clone(&loaded.instance),
                Arc::clone(&loaded.connectors),
                loaded.class_name.clone(),
                loaded.thread.take(),
            )))
        })?;
        let Some((instance, connectors, class_name, thread)) = taken else {
            return Ok(());
        };
        self.publish(ManagerEvent::ModuleStateChanged {
            module: id.clone(),
            state: ModuleState::Deactivating,
        });

        let outcome = match &thread {
            Some(handle) => {
                let target = Arc::clone(&instance);
                self.threads
                    .invoke_blocking(handle, move || target.on_deactivate())
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r)
            }
            None => guarded(|| instance.on_deactivate()),
        };

        if let Some(class) = &class_name {
            let vars = guarded(|| Ok(instance.status_variables())).unwrap_or_else(|e| {
                tracing::warn!(module = %id, error = %e, "Cannot collect status variables");
                StatusVariables::new()
            });
            if let Err(e) = self.status.save(class, id.base, &id.name, &vars) {
                tracing::warn!(module = %id, error = %e, "Failed to save status variables");
            }
        }
        if let Some(handle) = &thread {
            self.stop_thread(id, handle.name());
        }
        connectors.disconnect_all();

        match outcome {
            Ok(()) => {
                self.set_state(id, ModuleState::Deactivated)?;
                tracing::info!(module = %id, "Module deactivated");
                self.publish(ManagerEvent::ModuleDeactivated(id.clone()));
                Ok(())
            }
            Err(source) => {
                tracing::error!(module = %id, error = %format!("{source:#}"), "Module deactivation failed");
                self.mark_broken(id);
                Err(ManagerError::Deactivation {
                    module: id.clone(),
                    source,
                })
            }
        }
    }

    /// Drop the instance from the loaded tier, deactivating it first.
    ///
    /// # Errors
    /// Returns `ManagerError::NotLoaded` or any error from `deactivate_module`.
    pub fn unload_module(&self, id: &ModuleId) -> Result<(), ManagerError> {
        if !self.is_loaded(id) {
            return Err(ManagerError::NotLoaded { module: id.clone() });
        }
        self.deactivate_module(id, false)?;
        let removed = self.with_tree(|t| t.loaded.remove(id));
        if let Some(module) = removed {
            module.connectors.disconnect_all();
            if let Some(thread) = module.thread {
                self.stop_thread(id, thread.name());
            }
            tracing::info!(module = %id, "Module unloaded");
            self.publish(ManagerEvent::ModuleUnloaded(id.clone()));
        }
        Ok(())
    }

    fn start_gate(&self, id: &ModuleId) -> Arc<ReentrantMutex<()>> {
        Arc::clone(self.start_gates.entry(id.clone()).or_default().value())
    }

    /// Bring one module to the active state, loading and connecting it as needed.
    /// Returns whether this call activated it.
    ///
    /// Callers starting the same module wait for each other; the later one finds it
    /// active. The gate is reentrant so an activation hook may start other modules.
    pub(crate) fn ensure_active(&self, id: &ModuleId) -> Result<bool, ManagerError> {
        let gate = self.start_gate(id);
        let _starting = gate.lock();
        let state = self.read_tree(|t| t.loaded.get(id).map(|m| m.state));
        match state {
            Some(ModuleState::Active) => {
                if id.base == ModuleBase::Gui {
                    let instance = self.instance(id)?;
                    guarded(|| {
                        instance.show();
                        Ok(())
                    })
                    .unwrap_or_else(|e| tracing::warn!(module = %id, error = %e, "show() failed"));
                }
                Ok(false)
            }
            Some(ModuleState::Broken) => Err(ManagerError::Broken { module: id.clone() }),
            Some(ModuleState::Connected) => self.activate_module(id),
            Some(ModuleState::Deactivated) => {
                self.connect_module(id)?;
                self.activate_module(id)
            }
            Some(other) => Err(ManagerError::InvalidTransition {
                module: id.clone(),
                from: other,
                to: ModuleState::Active,
            }),
            None => {
                self.load_module(id)?;
                self.connect_module(id)?;
                self.activate_module(id)
            }
        }
    }
}
