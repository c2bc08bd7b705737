//! Headless stand-in for the counter window.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use labkit::{ConnectorDecl, Connectors, Module, ModuleBase, ModuleClass, ModuleCtx};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{COUNTER_GUI, COUNTER_LOGIC};

pub const CLASS_PATH: &str = "dummy.CounterPanel";
pub const LOGIC_CONNECTOR: &str = "counterlogic1";

pub(crate) fn class() -> ModuleClass {
    ModuleClass::new(ModuleBase::Gui, CLASS_PATH, |_init| {
        Ok(Arc::new(CounterPanel::default()) as Arc<dyn Module>)
    })
    .with_connector(ConnectorDecl::required(LOGIC_CONNECTOR, COUNTER_LOGIC))
}

/// Methods: `refresh` (summary of the logic's trace), `shown` (how often `show` ran).
#[derive(Default)]
pub struct CounterPanel {
    connectors: Mutex<Option<Arc<Connectors>>>,
    shown: AtomicUsize,
}

impl CounterPanel {
    fn refresh(&self) -> anyhow::Result<Value> {
        let connectors = self
            .connectors
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{CLASS_PATH} is not active"))?;
        let logic = connectors.module(LOGIC_CONNECTOR)?;
        let trace: Vec<f64> = serde_json::from_value(logic.invoke("get_trace", Value::Null)?)?;
        let last = trace.last().copied();
        let peak = trace.iter().copied().reduce(f64::max);
        Ok(json!({
            "points": trace.len(),
            "last": last,
            "peak": peak,
            "counting": logic.is_busy(),
        }))
    }
}

impl Module for CounterPanel {
    fn interfaces(&self) -> Vec<String> {
        vec![COUNTER_GUI.to_owned()]
    }

    fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        ctx.connected(LOGIC_CONNECTOR)?;
        *self.connectors.lock() = Some(Arc::clone(ctx.connectors()));
        self.show();
        Ok(())
    }

    fn on_deactivate(&self) -> anyhow::Result<()> {
        *self.connectors.lock() = None;
        Ok(())
    }

    fn invoke(&self, method: &str, _args: Value) -> anyhow::Result<Value> {
        match method {
            "refresh" => self.refresh(),
            "shown" => Ok(json!(self.shown.load(Ordering::SeqCst))),
            other => anyhow::bail!("method '{other}' is not supported by {CLASS_PATH}"),
        }
    }

    fn show(&self) {
        self.shown.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(class = CLASS_PATH, "Counter panel raised");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
