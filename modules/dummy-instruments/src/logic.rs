//! Counter logic: samples the connected counter into a bounded trace.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use labkit::{
    ConnectorDecl, Connectors, Module, ModuleBase, ModuleClass, ModuleCtx, StatusVariables,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::config::CounterLogicConfig;
use crate::hardware::options;
use crate::{COUNTER_LOGIC, SLOW_COUNTER};

pub const CLASS_PATH: &str = "dummy.CounterLogic";
pub const COUNTER_CONNECTOR: &str = "counter1";

pub(crate) fn class() -> ModuleClass {
    ModuleClass::new(ModuleBase::Logic, CLASS_PATH, |init| {
        let config = options::<CounterLogicConfig>(init)?;
        Ok(Arc::new(CounterLogic::new(config)) as Arc<dyn Module>)
    })
    .with_connector(ConnectorDecl::required(COUNTER_CONNECTOR, SLOW_COUNTER))
    .threaded()
}

#[derive(Default)]
struct Run {
    settings: Option<CounterLogicConfig>,
    connectors: Option<Arc<Connectors>>,
    trace: VecDeque<f64>,
    counting: bool,
}

/// Methods: `start_count`, `stop_count`, `count_once`, `get_trace`, `get_settings`,
/// `set_count_length {length}`, `set_count_frequency {frequency}`.
///
/// A counting module reports itself busy.
pub struct CounterLogic {
    defaults: CounterLogicConfig,
    run: Mutex<Run>,
}

impl CounterLogic {
    #[must_use]
    pub fn new(defaults: CounterLogicConfig) -> Self {
        Self {
            defaults,
            run: Mutex::new(Run::default()),
        }
    }

    fn settings(&self) -> CounterLogicConfig {
        self.run
            .lock()
            .settings
            .clone()
            .unwrap_or_else(|| self.defaults.clone())
    }

    fn counter(&self) -> anyhow::Result<Arc<dyn Module>> {
        let connectors = self
            .run
            .lock()
            .connectors
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{CLASS_PATH} is not active"))?;
        Ok(connectors.module(COUNTER_CONNECTOR)?)
    }

    fn start_count(&self) -> anyhow::Result<Value> {
        if self.run.lock().counting {
            return Ok(Value::Null);
        }
        let settings = self.settings();
        self.counter()?
            .invoke("set_up_clock", json!({"frequency": settings.count_frequency}))?;
        let mut run = self.run.lock();
        run.trace.clear();
        run.counting = true;
        tracing::info!(frequency = settings.count_frequency, "Counting started");
        Ok(Value::Null)
    }

    fn stop_count(&self) -> anyhow::Result<Value> {
        if !std::mem::take(&mut self.run.lock().counting) {
            return Ok(Value::Null);
        }
        self.counter()?.invoke("close_clock", Value::Null)?;
        tracing::info!("Counting stopped");
        Ok(Value::Null)
    }

    fn count_once(&self) -> anyhow::Result<Value> {
        let settings = self.settings();
        anyhow::ensure!(self.run.lock().counting, "counting has not been started");
        let raw = self
            .counter()?
            .invoke("get_counter", json!({"samples": settings.counting_samples}))?;
        let counts: Vec<f64> = serde_json::from_value(raw)?;

        let mut run = self.run.lock();
        run.trace.extend(counts.iter().copied());
        while run.trace.len() > settings.count_length {
            run.trace.pop_front();
        }
        Ok(json!(counts))
    }

    fn update_settings(&self, f: impl FnOnce(&mut CounterLogicConfig)) -> Value {
        let mut settings = self.settings();
        f(&mut settings);
        let mut run = self.run.lock();
        while run.trace.len() > settings.count_length {
            run.trace.pop_front();
        }
        let value = json!(settings);
        run.settings = Some(settings);
        value
    }
}

fn restore(defaults: &CounterLogicConfig, vars: &StatusVariables) -> CounterLogicConfig {
    let mut settings = defaults.clone();
    if let Some(length) = vars
        .get("count_length")
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
    {
        settings.count_length = length;
    }
    if let Some(frequency) = vars.get("count_frequency").and_then(Value::as_f64) {
        settings.count_frequency = frequency;
    }
    if let Some(samples) = vars
        .get("counting_samples")
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
    {
        settings.counting_samples = samples;
    }
    settings
}

impl Module for CounterLogic {
    fn interfaces(&self) -> Vec<String> {
        vec![COUNTER_LOGIC.to_owned()]
    }

    fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        ctx.connected(COUNTER_CONNECTOR)?;
        let settings = restore(&self.defaults, ctx.status_variables());
        tracing::info!(
            module = %ctx.id(),
            count_length = settings.count_length,
            count_frequency = settings.count_frequency,
            "Counter logic activated"
        );
        let mut run = self.run.lock();
        run.settings = Some(settings);
        run.connectors = Some(Arc::clone(ctx.connectors()));
        run.trace.clear();
        run.counting = false;
        Ok(())
    }

    fn on_deactivate(&self) -> anyhow::Result<()> {
        if let Err(e) = self.stop_count() {
            tracing::warn!(error = %e, "Cannot stop counting cleanly");
        }
        self.run.lock().connectors = None;
        Ok(())
    }

    fn invoke(&self, method: &str, args: Value) -> anyhow::Result<Value> {
        match method {
            "start_count" => self.start_count(),
            "stop_count" => self.stop_count(),
            "count_once" => self.count_once(),
            "get_trace" => Ok(json!(self.run.lock().trace)),
            "get_settings" => Ok(json!(self.settings())),
            "set_count_length" => {
                let length = args
                    .get("length")
                    .and_then(Value::as_u64)
                    .and_then(|v| usize::try_from(v).ok())
                    .filter(|v| *v > 0)
                    .ok_or_else(|| anyhow::anyhow!("'length' must be a positive integer"))?;
                Ok(self.update_settings(|s| s.count_length = length))
            }
            "set_count_frequency" => {
                anyhow::ensure!(
                    !self.run.lock().counting,
                    "cannot change the frequency while counting"
                );
                let frequency = args
                    .get("frequency")
                    .and_then(Value::as_f64)
                    .filter(|f| *f > 0.0)
                    .ok_or_else(|| anyhow::anyhow!("'frequency' must be a positive number"))?;
                Ok(self.update_settings(|s| s.count_frequency = frequency))
            }
            other => anyhow::bail!("method '{other}' is not supported by {CLASS_PATH}"),
        }
    }

    fn status_variables(&self) -> StatusVariables {
        let settings = self.settings();
        StatusVariables::from_iter([
            ("count_length".to_owned(), json!(settings.count_length)),
            ("count_frequency".to_owned(), json!(settings.count_frequency)),
            ("counting_samples".to_owned(), json!(settings.counting_samples)),
        ])
    }

    fn is_busy(&self) -> bool {
        self.run.lock().counting
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn status_variables_override_options() {
        let defaults = CounterLogicConfig {
            count_length: 20,
            ..CounterLogicConfig::default()
        };
        let vars = StatusVariables::from_iter([
            ("count_length".to_owned(), json!(5)),
            ("count_frequency".to_owned(), "garbage".into()),
        ]);

        let settings = restore(&defaults, &vars);

        assert_eq!(settings.count_length, 5);
        assert!((settings.count_frequency - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn calls_before_activation_fail_cleanly() {
        let logic = CounterLogic::new(CounterLogicConfig::default());
        assert!(logic.invoke("start_count", Value::Null).is_err());
        assert!(logic.invoke("count_once", Value::Null).is_err());
        assert!(!logic.is_busy());
        assert_eq!(logic.invoke("get_trace", Value::Null).unwrap(), json!([]));
    }

    #[test]
    fn settings_are_validated() {
        let logic = CounterLogic::new(CounterLogicConfig::default());
        assert!(logic.invoke("set_count_length", json!({"length": 0})).is_err());
        let updated = logic
            .invoke("set_count_length", json!({"length": 12}))
            .unwrap();
        assert_eq!(updated["count_length"], json!(12));
        assert_eq!(logic.status_variables()["count_length"], json!(12));
    }
}
