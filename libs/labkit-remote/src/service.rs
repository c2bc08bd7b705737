//! Server-side request handling on top of the manager's share table.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use labkit::{Manager, Module, ModuleId};
use serde_json::Value;

use crate::error::RemoteError;
use crate::protocol::{Request, Response};

/// Answers remote requests for the modules a manager shares.
///
/// Holds the manager weakly: once the process drops it every request fails with
/// `RemoteError::ManagerGone`.
#[derive(Clone)]
pub struct RemoteModuleService {
    manager: Weak<Manager>,
}

impl RemoteModuleService {
    #[must_use]
    pub fn new(manager: &Arc<Manager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }

    fn manager(&self) -> Result<Arc<Manager>, RemoteError> {
        self.manager.upgrade().ok_or(RemoteError::ManagerGone)
    }

    fn shared_id(manager: &Manager, name: &str) -> Result<ModuleId, RemoteError> {
        manager
            .shared_module(name)
            .ok_or_else(|| RemoteError::Unavailable {
                name: name.to_owned(),
                reason: "no module is shared under this name".to_owned(),
            })
    }

    /// The single entry point of the remote protocol: look `name` up in the share
    /// table, start it (and its dependencies) if it is not active, return the instance.
    ///
    /// # Errors
    /// Returns `RemoteError::Unavailable` if the name is not shared or the module
    /// cannot be started.
    pub fn expose_get_module(&self, name: &str) -> Result<(ModuleId, Arc<dyn Module>), RemoteError> {
        let manager = self.manager()?;
        let id = Self::shared_id(&manager, name)?;
        let unavailable = |reason: String| RemoteError::Unavailable {
            name: name.to_owned(),
            reason,
        };

        if !manager.is_active(&id) {
            tracing::info!(module = %id, "Starting shared module on remote request");
            manager
                .start_module(&id)
                .map_err(|e| unavailable(e.to_string()))?;
        }
        let instance = manager
            .instance(&id)
            .map_err(|e| unavailable(e.to_string()))?;
        Ok((id, instance))
    }

    /// Names currently shared.
    ///
    /// # Errors
    /// Returns `RemoteError::ManagerGone` once the manager is dropped.
    pub fn available_module_names(&self) -> Result<Vec<String>, RemoteError> {
        Ok(self.manager()?.shared_module_names())
    }

    /// Shared names whose module is active.
    ///
    /// # Errors
    /// Returns `RemoteError::ManagerGone` once the manager is dropped.
    pub fn active_module_names(&self) -> Result<Vec<String>, RemoteError> {
        let manager = self.manager()?;
        Ok(manager
            .shared_module_names()
            .into_iter()
            .filter(|name| {
                manager
                    .shared_module(name)
                    .is_some_and(|id| manager.is_active(&id))
            })
            .collect())
    }

    fn invoke(&self, name: &str, method: &str, args: Value) -> Result<Value, RemoteError> {
        let (id, instance) = self.expose_get_module(name)?;
        let outcome = catch_unwind(AssertUnwindSafe(|| instance.invoke(method, args)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("method '{method}' panicked")));
        outcome.map_err(|e| {
            tracing::debug!(module = %id, method, error = %e, "Remote invocation failed");
            RemoteError::Remote {
                message: format!("{e:#}"),
            }
        })
    }

    /// Turn one request into its response. Failures become `Response::Error`.
    #[must_use]
    pub fn handle(&self, request: Request) -> Response {
        let op = request.op();
        let result = match request {
            Request::GetModule { name } => self.expose_get_module(&name).map(|(id, instance)| {
                Response::Module {
                    name: id.name,
                    base: id.base,
                    interfaces: instance.interfaces(),
                }
            }),
            Request::Invoke {
                module,
                method,
                args,
            } => self
                .invoke(&module, &method, args)
                .map(|value| Response::Value { value }),
            Request::State { module } => self.manager().and_then(|manager| {
                let id = Self::shared_id(&manager, &module)?;
                Ok(Response::State {
                    state: manager.module_state(&id).ok().flatten(),
                })
            }),
            Request::ListShared => self
                .available_module_names()
                .map(|names| Response::Names { names }),
            Request::ListActive => self
                .active_module_names()
                .map(|names| Response::Names { names }),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(op, error = %e, "Remote request failed");
            Response::error(e.to_string())
        })
    }
}
