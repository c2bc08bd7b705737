use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::connector::Connectors;
use crate::context::ModuleCtx;
use crate::descriptor::ModuleId;

/// Persisted per-module key/value state.
pub type StatusVariables = Map<String, Value>;

/// Core module contract: the only ABI the orchestrator depends on.
///
/// Hooks run either on the caller's thread or, for threaded module classes, on the
/// module's dedicated worker thread. Method calls from other modules go through
/// [`Module::invoke`], which is also what remote proxies forward over the wire.
pub trait Module: Send + Sync + 'static {
    /// Interface identifiers this instance satisfies. Connectors check against this set.
    fn interfaces(&self) -> Vec<String>;

    fn implements(&self, interface: &str) -> bool {
        self.interfaces().iter().any(|i| i == interface)
    }

    /// Activation hook. Connectors are bound and status variables restored when this runs.
    ///
    /// # Errors
    /// Any error marks the module broken.
    fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    /// Deactivation hook.
    ///
    /// # Errors
    /// Any error marks the module broken; teardown of other modules continues.
    fn on_deactivate(&self) -> anyhow::Result<()>;

    /// Dynamic method dispatch.
    ///
    /// # Errors
    /// The default implementation knows no methods.
    fn invoke(&self, method: &str, _args: Value) -> anyhow::Result<Value> {
        anyhow::bail!("method '{method}' is not supported")
    }

    /// Snapshot written to disk after deactivation.
    fn status_variables(&self) -> StatusVariables {
        StatusVariables::new()
    }

    /// A busy module is reported as `Locked` and is not deactivated without confirmation.
    fn is_busy(&self) -> bool {
        false
    }

    /// Raise the module's window. Only meaningful for gui modules.
    fn show(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Everything a plugin factory receives to build an instance.
#[derive(Clone)]
pub struct ModuleInit {
    pub id: ModuleId,
    pub options: Map<String, Value>,
    pub connectors: Arc<Connectors>,
}

/// `Module::is_busy` behind the panic boundary. A module that panics here counts as idle.
pub(crate) fn reports_busy(instance: &dyn Module) -> bool {
    guarded(|| Ok(instance.is_busy())).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "is_busy() failed; treating the module as idle");
        false
    })
}

/// Run module code, turning a panic into an error so it cannot unwind through the manager.
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(anyhow::anyhow!(
            "module code panicked: {}",
            panic_message(payload.as_ref())
        ))
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
