//! Multi-module operations driven by a dependency plan: start, stop, restart, quit.

use indexmap::IndexSet;

use crate::descriptor::ModuleId;
use crate::events::ManagerEvent;
use crate::manager::{Manager, ManagerError, ModuleState};
use crate::resolver::{self, DependencyGraph};

/// Outcome of a teardown. Failures are collected, never fatal.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Modules deactivated by this call, in order.
    pub deactivated: Vec<ModuleId>,
    /// Modules that could not be deactivated and were skipped.
    pub failed: Vec<(ModuleId, ManagerError)>,
}

impl StopReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub enum QuitOutcome {
    /// Busy modules were found and the confirmation callback declined.
    Cancelled { busy: Vec<ModuleId> },
    Completed(StopReport),
}

/// Outcome of bulk configuration.
#[derive(Debug, Default)]
pub struct ConfigureReport {
    pub added: Vec<ModuleId>,
    pub rejected: Vec<(ModuleId, ManagerError)>,
}

impl Manager {
    /// Activation plan for `id`: its forward dependencies, dependencies first.
    ///
    /// # Errors
    /// Returns `ManagerError::Resolution` on unknown or ambiguous targets and on cycles.
    pub fn start_plan(&self, id: &ModuleId) -> Result<Vec<ModuleId>, ManagerError> {
        let resolution = self.read_tree(|t| resolver::forward_dependencies(&t.defined, id));
        let graph = resolution
            .into_result()
            .map_err(|errors| ManagerError::Resolution {
                module: id.clone(),
                errors,
            })?;
        resolver::toposort(&graph).map_err(|e| ManagerError::Resolution {
            module: id.clone(),
            errors: vec![e],
        })
    }

    /// Start `id` and everything it depends on, dependencies first.
    ///
    /// Already active modules are left alone (gui modules are asked to show themselves).
    /// The plan stops at the first failure. Modules started before it stay running;
    /// there is no rollback, so a partially started plan leaves whatever could be started
    /// available. The error lists them.
    ///
    /// Returns the modules this call activated.
    ///
    /// # Errors
    /// Returns `ManagerError::Resolution` if no valid plan exists (nothing is started),
    /// or `ManagerError::StartAborted` naming the failing module.
    pub fn start_module(&self, id: &ModuleId) -> Result<Vec<ModuleId>, ManagerError> {
        let plan = self.start_plan(id)?;
        tracing::debug!(
            module = %id,
            plan = ?plan.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Start plan"
        );

        let mut started = Vec::new();
        for step in &plan {
            match self.ensure_active(step) {
                Ok(true) => started.push(step.clone()),
                Ok(false) => {}
                Err(source) => {
                    tracing::error!(module = %id, failed = %step, error = %source, "Start aborted");
                    return Err(ManagerError::StartAborted {
                        failed: step.clone(),
                        started,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(started)
    }

    /// Teardown set of `id`: its forward dependencies plus every loaded module depending
    /// on it, ordered dependents first.
    fn stop_plan(&self, id: &ModuleId, include_dependencies: bool) -> Result<Vec<ModuleId>, ManagerError> {
        let graph = self.read_tree(|t| {
            let mut members: IndexSet<ModuleId> = IndexSet::new();
            if include_dependencies {
                members.extend(resolver::forward_dependencies(&t.defined, id).graph.into_keys());
            } else {
                members.insert(id.clone());
            }
            members.extend(
                resolver::reverse_dependencies(&t.defined, id)
                    .graph
                    .into_keys()
                    .filter(|m| t.loaded.contains(m)),
            );
            resolver::graph_of(&t.defined, &members).graph
        });
        let mut order = resolver::toposort(&graph).map_err(|e| ManagerError::Resolution {
            module: id.clone(),
            errors: vec![e],
        })?;
        order.reverse();
        Ok(order)
    }

    fn deactivate_in_order(&self, order: &[ModuleId], force: bool) -> StopReport {
        let mut report = StopReport::default();
        for step in order {
            let was_active = self.read_tree(|t| t.loaded.get(step).is_some_and(|m| m.state.is_active()));
            if !was_active {
                continue;
            }
            match self.deactivate_module(step, force) {
                Ok(()) => report.deactivated.push(step.clone()),
                Err(e) => {
                    tracing::warn!(module = %step, error = %e, "Skipping module that cannot be deactivated");
                    report.failed.push((step.clone(), e));
                }
            }
        }
        report
    }

    /// Stop `id`, the modules depending on it, and the modules it depends on, in the
    /// reverse of the start order. A module that refuses is logged and skipped; modules
    /// it depends on then stay up because they still have an active dependent.
    ///
    /// # Errors
    /// Returns `ManagerError::NotDefined` or `ManagerError::Resolution` if no order can
    /// be computed; nothing is deactivated then.
    pub fn stop_module(&self, id: &ModuleId) -> Result<StopReport, ManagerError> {
        if !self.is_defined(id) {
            return Err(ManagerError::NotDefined { module: id.clone() });
        }
        let order = self.stop_plan(id, true)?;
        Ok(self.deactivate_in_order(&order, false))
    }

    /// Stop only `id` and its dependents, leaving its own dependencies running.
    pub(crate) fn stop_with_dependents(&self, id: &ModuleId) -> Result<StopReport, ManagerError> {
        let order = self.stop_plan(id, false)?;
        Ok(self.deactivate_in_order(&order, false))
    }

    /// Reload `id` and every module that transitively depends on it, then bring back
    /// the ones that were active, dependencies first.
    ///
    /// Returns the modules reactivated.
    ///
    /// # Errors
    /// Returns an error if the teardown leaves a module active, if a module cannot be
    /// reloaded, or if reactivation fails (as `ManagerError::StartAborted`).
    pub fn restart_module_recursive(&self, id: &ModuleId) -> Result<Vec<ModuleId>, ManagerError> {
        let reverse = self.read_tree(|t| {
            if t.defined.contains(id) {
                Ok(resolver::reverse_dependencies(&t.defined, id).graph)
            } else {
                Err(ManagerError::NotDefined { module: id.clone() })
            }
        })?;
        // dependents first
        let teardown = resolver::toposort(&reverse).map_err(|e| ManagerError::Resolution {
            module: id.clone(),
            errors: vec![e],
        })?;

        let was_active: IndexSet<ModuleId> = teardown
            .iter()
            .filter(|m| self.is_active(m))
            .cloned()
            .collect();

        for step in &teardown {
            if !self.is_loaded(step) {
                continue;
            }
            self.deactivate_module(step, false)?;
            self.unload_module(step)?;
            self.load_module(step)?;
            tracing::info!(module = %step, "Module reloaded");
        }

        let mut restarted = Vec::new();
        for step in teardown.iter().rev().filter(|m| was_active.contains(*m)) {
            match self.start_module(step) {
                Ok(activated) => restarted.extend(activated),
                Err(e) => {
                    let (failed, source) = match e {
                        ManagerError::StartAborted { failed, source, .. } => (failed, source),
                        other => (step.clone(), Box::new(other)),
                    };
                    return Err(ManagerError::StartAborted {
                        failed,
                        started: restarted,
                        source,
                    });
                }
            }
        }
        Ok(restarted)
    }

    /// Reload one module. Active modules are restarted together with their dependents;
    /// inactive ones are only re-instantiated.
    ///
    /// # Errors
    /// See `restart_module_recursive`.
    pub fn reload_module(&self, id: &ModuleId) -> Result<Vec<ModuleId>, ManagerError> {
        if self.is_active(id) {
            return self.restart_module_recursive(id);
        }
        if self.is_loaded(id) {
            self.unload_module(id)?;
        }
        self.load_module(id)?;
        Ok(Vec::new())
    }

    /// Teardown order over all loaded modules, dependents first. Falls back to reverse
    /// load order when the loaded set has a cycle.
    fn quit_order(&self) -> Vec<ModuleId> {
        let (graph, loaded): (DependencyGraph, Vec<ModuleId>) = self.read_tree(|t| {
            let loaded: IndexSet<ModuleId> = t.loaded.ids().collect();
            let graph = resolver::graph_of(&t.defined, &loaded).graph;
            (graph, loaded.into_iter().collect())
        });
        match resolver::toposort(&graph) {
            Ok(mut order) => {
                order.reverse();
                order
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot order loaded modules; stopping in reverse load order");
                loaded.into_iter().rev().collect()
            }
        }
    }

    /// Modules currently reporting themselves busy.
    #[must_use]
    pub fn busy_modules(&self) -> Vec<ModuleId> {
        self.module_states()
            .into_iter()
            .filter(|(_, state)| *state == Some(ModuleState::Locked))
            .map(|(id, _)| id)
            .collect()
    }

    /// Deactivate every loaded module, dependents first. If any module is busy,
    /// `confirm` is asked with the busy list and a `false` answer cancels the quit.
    pub fn quit(&self, confirm: &dyn Fn(&[ModuleId]) -> bool) -> QuitOutcome {
        let busy = self.busy_modules();
        if !busy.is_empty() && !confirm(&busy) {
            tracing::info!(busy = busy.len(), "Quit cancelled: modules are busy");
            return QuitOutcome::Cancelled { busy };
        }
        QuitOutcome::Completed(self.shutdown_all())
    }

    /// Deactivate every loaded module without asking.
    pub fn force_quit(&self) -> StopReport {
        self.shutdown_all()
    }

    fn shutdown_all(&self) -> StopReport {
        tracing::info!("Phase: quit");
        let order = self.quit_order();
        let report = self.deactivate_in_order(&order, true);
        for e in self.threads.quit_all(self.join_timeout) {
            tracing::warn!(error = %e, "Worker thread left behind");
        }
        self.publish(ManagerEvent::ManagerQuit);
        tracing::info!(
            deactivated = report.deactivated.len(),
            failed = report.failed.len(),
            "Manager quit"
        );
        report
    }

    /// Start every module listed in `global.startup`, in order. Failures are reported
    /// per name and do not prevent the remaining entries from starting.
    pub fn start_startup_modules(&self) -> Vec<(String, Result<Vec<ModuleId>, ManagerError>)> {
        let names = self.read_tree(|t| t.global.startup.clone());
        tracing::info!(count = names.len(), "Phase: startup");
        names
            .into_iter()
            .map(|name| {
                let result = self
                    .find_module(&name)
                    .map_err(ManagerError::from)
                    .and_then(|id| self.start_module(&id));
                if let Err(e) = &result {
                    tracing::error!(module = %name, error = %e, "Startup module failed");
                }
                (name, result)
            })
            .collect()
    }
}
