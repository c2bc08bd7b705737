//! Simulated slow photon counter.

use std::any::Any;
use std::sync::Arc;

use anyhow::Context;
use labkit::{Module, ModuleBase, ModuleClass, ModuleCtx, ModuleInit};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::SLOW_COUNTER;
use crate::config::CounterHardwareConfig;

pub const CLASS_PATH: &str = "dummy.CounterHardware";

pub(crate) fn options<T: DeserializeOwned + Default>(init: &ModuleInit) -> anyhow::Result<T> {
    if init.options.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_value(Value::Object(init.options.clone()))
        .with_context(|| format!("invalid options for {}", init.id))
}

pub(crate) fn class() -> ModuleClass {
    ModuleClass::new(ModuleBase::Hardware, CLASS_PATH, |init| {
        let config = options::<CounterHardwareConfig>(init)?;
        anyhow::ensure!(
            config.clock_frequency > 0.0,
            "clock_frequency must be positive"
        );
        Ok(Arc::new(CounterHardware::new(config)) as Arc<dyn Module>)
    })
}

struct Clock {
    frequency: f64,
    /// Phase of the simulated fluctuation, advanced per sample.
    phase: f64,
    running: bool,
}

/// Counter producing a deterministic, slowly oscillating count rate.
///
/// Methods: `get_constraints`, `set_up_clock {frequency}`, `get_counter {samples}`,
/// `close_clock`.
pub struct CounterHardware {
    config: CounterHardwareConfig,
    clock: Mutex<Clock>,
}

impl CounterHardware {
    #[must_use]
    pub fn new(config: CounterHardwareConfig) -> Self {
        let clock = Clock {
            frequency: config.clock_frequency,
            phase: 0.0,
            running: false,
        };
        Self {
            config,
            clock: Mutex::new(clock),
        }
    }

    fn set_up_clock(&self, args: &Value) -> anyhow::Result<Value> {
        let frequency = args
            .get("frequency")
            .and_then(Value::as_f64)
            .unwrap_or(self.config.clock_frequency);
        anyhow::ensure!(frequency > 0.0, "clock frequency must be positive");
        let mut clock = self.clock.lock();
        clock.frequency = frequency;
        clock.running = true;
        tracing::debug!(frequency, "Counter clock set up");
        Ok(json!(frequency))
    }

    /// Counts per bin for `samples` consecutive bins.
    fn read(&self, samples: u64) -> anyhow::Result<Vec<f64>> {
        let mut clock = self.clock.lock();
        anyhow::ensure!(clock.running, "counter clock is not running");
        let per_bin = self.config.count_rate / clock.frequency;
        let mut counts = Vec::new();
        for _ in 0..samples {
            counts.push(per_bin * (1.0 + self.config.noise * clock.phase.sin()));
            clock.phase += 0.1;
        }
        Ok(counts)
    }
}

impl Module for CounterHardware {
    fn interfaces(&self) -> Vec<String> {
        vec![SLOW_COUNTER.to_owned()]
    }

    fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let mut clock = self.clock.lock();
        clock.phase = 0.0;
        clock.running = false;
        tracing::info!(module = %ctx.id(), rate = self.config.count_rate, "Dummy counter ready");
        Ok(())
    }

    fn on_deactivate(&self) -> anyhow::Result<()> {
        self.clock.lock().running = false;
        Ok(())
    }

    fn invoke(&self, method: &str, args: Value) -> anyhow::Result<Value> {
        match method {
            "get_constraints" => Ok(json!({
                "max_detectors": 1,
                "min_count_frequency": 1e-3,
                "max_count_frequency": 1e6,
            })),
            "set_up_clock" => self.set_up_clock(&args),
            "get_counter" => {
                let samples = args.get("samples").and_then(Value::as_u64).unwrap_or(1);
                Ok(json!(self.read(samples)?))
            }
            "close_clock" => {
                self.clock.lock().running = false;
                Ok(Value::Null)
            }
            other => anyhow::bail!("method '{other}' is not supported by {CLASS_PATH}"),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
