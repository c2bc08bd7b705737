#![allow(dead_code)]

use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use labkit::{
    ConfigTree, ConnectorDecl, Manager, Module, ModuleBase, ModuleClass, ModuleCtx, ModuleId,
    ModuleInit, PluginRegistry, StatusVariables,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Ordered record of lifecycle hooks, shared by every recorder of one test.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub struct Recorder {
    id: ModuleId,
    interfaces: Vec<String>,
    journal: Journal,
    fail_activate: bool,
    /// Hook that panics: `"interfaces"` or `"is_busy"`.
    panic_in: Option<String>,
    pub busy: AtomicBool,
    gain: Mutex<Option<f64>>,
    activation_thread: Mutex<Option<String>>,
}

impl Recorder {
    pub fn new(id: ModuleId, interfaces: &[&str], journal: Journal) -> Self {
        Self {
            id,
            interfaces: interfaces.iter().map(|s| (*s).to_owned()).collect(),
            journal,
            fail_activate: false,
            panic_in: None,
            busy: AtomicBool::new(false),
            gain: Mutex::new(None),
            activation_thread: Mutex::new(None),
        }
    }

    pub fn gain(&self) -> Option<f64> {
        *self.gain.lock()
    }

    pub fn activation_thread(&self) -> Option<String> {
        self.activation_thread.lock().clone()
    }
}

impl Module for Recorder {
    fn interfaces(&self) -> Vec<String> {
        assert!(
            self.panic_in.as_deref() != Some("interfaces"),
            "interface table of {} is corrupted",
            self.id
        );
        self.interfaces.clone()
    }

    fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        if self.fail_activate {
            anyhow::bail!("hardware not responding");
        }
        *self.gain.lock() = ctx.status_variables().get("gain").and_then(Value::as_f64);
        *self.activation_thread.lock() = std::thread::current().name().map(str::to_owned);
        self.journal.lock().push(format!("activate {}", self.id));
        Ok(())
    }

    fn on_deactivate(&self) -> anyhow::Result<()> {
        self.journal.lock().push(format!("deactivate {}", self.id));
        Ok(())
    }

    fn invoke(&self, method: &str, args: Value) -> anyhow::Result<Value> {
        match method {
            "set_gain" => {
                *self.gain.lock() = args.as_f64();
                Ok(Value::Null)
            }
            "gain" => Ok(json!(self.gain())),
            other => anyhow::bail!("method '{other}' is not supported"),
        }
    }

    fn status_variables(&self) -> StatusVariables {
        let mut vars = StatusVariables::new();
        if let Some(gain) = self.gain() {
            vars.insert("gain".to_owned(), json!(gain));
        }
        vars
    }

    fn is_busy(&self) -> bool {
        assert!(
            self.panic_in.as_deref() != Some("is_busy"),
            "{} lost track of its acquisition",
            self.id
        );
        self.busy.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn recorder_class(
    base: ModuleBase,
    class_path: &str,
    interfaces: &'static [&'static str],
    journal: &Journal,
) -> ModuleClass {
    let journal = Arc::clone(journal);
    ModuleClass::new(base, class_path, move |init: &ModuleInit| {
        let mut recorder = Recorder::new(init.id.clone(), interfaces, Arc::clone(&journal));
        recorder.fail_activate = init
            .options
            .get("fail_activate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        recorder.panic_in = init
            .options
            .get("panic_in")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Some(ms) = init.options.get("load_delay_ms").and_then(Value::as_u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }
        Ok(Arc::new(recorder) as Arc<dyn Module>)
    })
}

/// Classes used across the tests:
/// `test.Counter` (hardware, offers `counter`), `test.CounterLogic` and
/// `test.ThreadedLogic` (logic, need `counter`, offer `counter_logic`), `test.Panel`
/// (gui, needs `counter_logic`) and `test.Node` (logic, optional `next` of type `node`).
pub fn registry(journal: &Journal) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    let classes = [
        recorder_class(ModuleBase::Hardware, "test.Counter", &["counter"], journal),
        recorder_class(ModuleBase::Logic, "test.CounterLogic", &["counter_logic"], journal)
            .with_connector(ConnectorDecl::required("counter", "counter")),
        recorder_class(ModuleBase::Logic, "test.ThreadedLogic", &["counter_logic"], journal)
            .with_connector(ConnectorDecl::required("counter", "counter"))
            .threaded(),
        recorder_class(ModuleBase::Gui, "test.Panel", &["panel"], journal)
            .with_connector(ConnectorDecl::required("logic", "counter_logic")),
        recorder_class(ModuleBase::Logic, "test.Node", &["node"], journal)
            .with_connector(ConnectorDecl::optional("next", "node")),
    ];
    for class in classes {
        registry.register(class).unwrap();
    }
    registry
}

pub const SCENARIO: &str = r"
hardware:
  counter:
    module.Class: test.Counter
logic:
  logic1:
    module.Class: test.CounterLogic
    connect:
      counter: counter
gui:
  gui1:
    module.Class: test.Panel
    connect:
      logic: logic1
";

pub fn manager_with(yaml: &str, journal: &Journal, status_dir: &Path) -> Arc<Manager> {
    let manager = Manager::builder(registry(journal))
        .with_status_dir(status_dir)
        .build();
    let report = manager.configure(ConfigTree::from_yaml_str(yaml).unwrap());
    assert!(report.rejected.is_empty(), "rejected: {:?}", report.rejected);
    manager
}

pub fn module_of(manager: &Manager, id: &ModuleId) -> Arc<dyn Module> {
    manager.instance(id).unwrap()
}

pub fn hw(name: &str) -> ModuleId {
    ModuleId::new(ModuleBase::Hardware, name)
}

pub fn logic(name: &str) -> ModuleId {
    ModuleId::new(ModuleBase::Logic, name)
}

pub fn gui(name: &str) -> ModuleId {
    ModuleId::new(ModuleBase::Gui, name)
}
