#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use labkit::descriptor::DescriptorError;
use labkit::{
    ConnectorError, Manager, ManagerError, Module, ModuleBase, ModuleDescriptor, ModuleId,
    ModuleState, PluginRegistry, QuitOutcome, RemoteModuleConnector, RemoteUrl, ResolveError,
    TlsFiles,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use support::{Journal, Recorder, SCENARIO, gui, hw, journal, logic, manager_with, module_of};

fn scenario() -> (Arc<Manager>, Journal, TempDir) {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let manager = manager_with(SCENARIO, &journal, dir.path());
    (manager, journal, dir)
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().clone()
}

#[test]
fn start_activates_dependencies_first() {
    let (manager, journal, _dir) = scenario();

    let started = manager.start_module(&gui("gui1")).unwrap();

    assert_eq!(started, vec![hw("counter"), logic("logic1"), gui("gui1")]);
    assert_eq!(
        entries(&journal),
        vec![
            "activate hardware.counter",
            "activate logic.logic1",
            "activate gui.gui1"
        ]
    );
    for id in [hw("counter"), logic("logic1"), gui("gui1")] {
        assert_eq!(manager.module_state(&id).unwrap(), Some(ModuleState::Active));
    }
}

#[test]
fn second_start_is_a_no_op() {
    let (manager, journal, _dir) = scenario();
    manager.start_module(&gui("gui1")).unwrap();
    let before = entries(&journal);

    let started = manager.start_module(&gui("gui1")).unwrap();

    assert!(started.is_empty());
    assert_eq!(entries(&journal), before);
}

#[test]
fn cyclic_plan_activates_nothing() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let manager = manager_with(
        r"
logic:
  a:
    module.Class: test.Node
    connect:
      next: b
  b:
    module.Class: test.Node
    connect:
      next: a
",
        &journal,
        dir.path(),
    );

    let err = manager.start_module(&logic("a")).unwrap_err();

    let ManagerError::Resolution { errors, .. } = &err else {
        panic!("expected a resolution error, got {err}");
    };
    assert!(matches!(errors.as_slice(), [ResolveError::Cycle { members }] if members.len() == 2));
    assert!(!manager.is_loaded(&logic("a")));
    assert!(!manager.is_loaded(&logic("b")));
    assert!(entries(&journal).is_empty());
}

#[test]
fn capability_mismatch_fails_the_owner_only() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let manager = manager_with(
        r"
hardware:
  counter:
    module.Class: test.Counter
gui:
  gui1:
    module.Class: test.Panel
    connect:
      logic: counter
",
        &journal,
        dir.path(),
    );

    let err = manager.start_module(&gui("gui1")).unwrap_err();

    let ManagerError::StartAborted {
        failed, started, ..
    } = &err
    else {
        panic!("expected an aborted start, got {err}");
    };
    assert_eq!(failed, &gui("gui1"));
    assert_eq!(started, &vec![hw("counter")]);
    let ManagerError::Connection { errors, .. } = err.root() else {
        panic!("expected a connection error, got {}", err.root());
    };
    assert!(matches!(
        errors.as_slice(),
        [ConnectorError::CapabilityMismatch { interface, .. }] if interface == "counter_logic"
    ));

    // no rollback: the dependency keeps running, the owner is loaded but idle
    assert!(manager.is_active(&hw("counter")));
    assert_eq!(
        manager.module_state(&gui("gui1")).unwrap(),
        Some(ModuleState::Deactivated)
    );
}

#[test]
fn stopping_a_dependency_tears_down_dependents_first() {
    let (manager, journal, _dir) = scenario();
    manager.start_module(&gui("gui1")).unwrap();
    journal.lock().clear();

    let report = manager.stop_module(&hw("counter")).unwrap();

    assert!(report.is_clean());
    assert_eq!(
        report.deactivated,
        vec![gui("gui1"), logic("logic1"), hw("counter")]
    );
    assert_eq!(
        entries(&journal),
        vec![
            "deactivate gui.gui1",
            "deactivate logic.logic1",
            "deactivate hardware.counter"
        ]
    );
}

#[test]
fn direct_deactivation_of_a_used_module_is_refused() {
    let (manager, _journal, _dir) = scenario();
    manager.start_module(&gui("gui1")).unwrap();

    let err = manager.deactivate_module(&hw("counter"), false).unwrap_err();

    assert!(matches!(
        err,
        ManagerError::HasActiveDependents { ref dependents, .. } if dependents == &vec![logic("logic1")]
    ));
    assert!(manager.is_active(&hw("counter")));
}

#[test]
fn status_variables_survive_deactivation_and_reload() {
    let (manager, _journal, dir) = scenario();
    manager.start_module(&logic("logic1")).unwrap();
    module_of(&manager, &logic("logic1"))
        .invoke("set_gain", json!(3.5))
        .unwrap();

    manager.stop_module(&logic("logic1")).unwrap();

    let vars = manager
        .load_module_status_variables(&logic("logic1"))
        .unwrap();
    assert_eq!(vars.get("gain"), Some(&json!(3.5)));
    assert!(
        dir.path()
            .join("status-CounterLogic_logic_logic1.json")
            .exists()
    );

    manager.unload_module(&logic("logic1")).unwrap();
    manager.start_module(&logic("logic1")).unwrap();
    let gain = module_of(&manager, &logic("logic1"))
        .invoke("gain", json!(null))
        .unwrap();
    assert_eq!(gain, json!(3.5));
}

#[test]
fn threaded_module_runs_hooks_on_its_own_worker() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let manager = manager_with(
        r"
hardware:
  counter:
    module.Class: test.Counter
logic:
  logic1:
    module.Class: test.ThreadedLogic
    connect:
      counter: counter
",
        &journal,
        dir.path(),
    );

    manager.start_module(&logic("logic1")).unwrap();

    let instance = module_of(&manager, &logic("logic1"));
    let recorder = instance.as_any().downcast_ref::<Recorder>().unwrap();
    assert_eq!(recorder.activation_thread().as_deref(), Some("mod-logic-logic1"));
    assert!(manager.threads().contains("mod-logic-logic1"));

    manager.stop_module(&logic("logic1")).unwrap();
    assert!(!manager.threads().contains("mod-logic-logic1"));
}

#[test]
fn failing_activation_marks_only_that_module_broken() {
    let (manager, _journal, _dir) = scenario();
    manager
        .add_module(
            ModuleBase::Hardware,
            "bad",
            &json!({"module.Class": "test.Counter", "fail_activate": true}),
        )
        .unwrap();
    manager.start_module(&gui("gui1")).unwrap();

    let err = manager.start_module(&hw("bad")).unwrap_err();

    assert!(matches!(err.root(), ManagerError::Activation { .. }));
    assert_eq!(
        manager.module_state(&hw("bad")).unwrap(),
        Some(ModuleState::Broken)
    );
    assert!(manager.is_active(&gui("gui1")));
    assert!(matches!(
        manager.start_module(&hw("bad")).unwrap_err().root(),
        ManagerError::Broken { .. }
    ));

    // reloading clears the broken state
    manager.reload_module(&hw("bad")).unwrap();
    assert_eq!(
        manager.module_state(&hw("bad")).unwrap(),
        Some(ModuleState::Deactivated)
    );
}

#[test]
fn restart_reloads_dependents_and_restores_them() {
    let (manager, journal, _dir) = scenario();
    manager.start_module(&gui("gui1")).unwrap();
    let old_logic = module_of(&manager, &logic("logic1"));
    journal.lock().clear();

    let restarted = manager.restart_module_recursive(&hw("counter")).unwrap();

    assert_eq!(restarted, vec![hw("counter"), logic("logic1"), gui("gui1")]);
    assert_eq!(
        entries(&journal),
        vec![
            "deactivate gui.gui1",
            "deactivate logic.logic1",
            "deactivate hardware.counter",
            "activate hardware.counter",
            "activate logic.logic1",
            "activate gui.gui1"
        ]
    );
    assert!(!Arc::ptr_eq(&old_logic, &module_of(&manager, &logic("logic1"))));
}

#[test]
fn quit_asks_before_stopping_busy_modules() {
    let (manager, _journal, _dir) = scenario();
    manager.start_module(&gui("gui1")).unwrap();
    let instance = module_of(&manager, &logic("logic1"));
    instance
        .as_any()
        .downcast_ref::<Recorder>()
        .unwrap()
        .busy
        .store(true, Ordering::SeqCst);
    assert_eq!(
        manager.module_state(&logic("logic1")).unwrap(),
        Some(ModuleState::Locked)
    );

    let outcome = manager.quit(&|_| false);
    assert!(matches!(outcome, QuitOutcome::Cancelled { ref busy } if busy == &vec![logic("logic1")]));
    assert!(manager.is_active(&hw("counter")));

    let asked = Mutex::new(Vec::new());
    let outcome = manager.quit(&|busy| {
        asked.lock().extend_from_slice(busy);
        true
    });
    let QuitOutcome::Completed(report) = outcome else {
        panic!("quit was cancelled");
    };
    assert_eq!(asked.into_inner(), vec![logic("logic1")]);
    assert_eq!(
        report.deactivated,
        vec![gui("gui1"), logic("logic1"), hw("counter")]
    );
    assert!(manager.active_modules().is_empty());
}

#[derive(Default)]
struct FakeConnector {
    calls: Mutex<Vec<String>>,
}

impl RemoteModuleConnector for FakeConnector {
    fn connect(&self, url: &RemoteUrl, tls: Option<&TlsFiles>) -> anyhow::Result<Arc<dyn Module>> {
        assert!(tls.is_none());
        self.calls
            .lock()
            .push(format!("{}:{}/{}", url.host(), url.port(), url.module_name()));
        Ok(Arc::new(Recorder::new(
            ModuleId::new(ModuleBase::Hardware, url.module_name()),
            &["counter"],
            journal(),
        )))
    }
}

#[test]
fn remote_descriptor_never_touches_the_plugin_registry() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(FakeConnector::default());
    // empty registry: a local instantiation attempt would fail
    let manager = Manager::builder(PluginRegistry::new())
        .with_status_dir(dir.path())
        .with_remote_connector(Arc::clone(&connector) as Arc<dyn RemoteModuleConnector>)
        .build();
    manager
        .add_module(
            ModuleBase::Hardware,
            "counter",
            &json!({"remote": "tcp://lab-pc:1234/shared_name"}),
        )
        .unwrap();

    let started = manager.start_module(&hw("counter")).unwrap();

    assert_eq!(started, vec![hw("counter")]);
    assert_eq!(*connector.calls.lock(), vec!["lab-pc:1234/shared_name"]);
    assert!(!manager.has_app_data(&hw("counter")).unwrap());
}

#[test]
fn remote_descriptor_without_connector_fails_like_a_load_error() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::builder(PluginRegistry::new())
        .with_status_dir(dir.path())
        .build();
    manager
        .add_module(
            ModuleBase::Hardware,
            "counter",
            &json!({"remote": "tcp://lab-pc:1234/shared_name"}),
        )
        .unwrap();

    let err = manager.start_module(&hw("counter")).unwrap_err();

    assert!(matches!(err.root(), ManagerError::NoRemoteConnector { .. }));
    assert!(!manager.is_loaded(&hw("counter")));
}

#[test]
fn startup_list_starts_each_name() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let yaml = format!("{SCENARIO}global:\n  startup: [gui1, missing]\n");
    let manager = manager_with(&yaml, &journal, dir.path());

    let results = manager.start_startup_modules();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "gui1");
    assert_eq!(results[0].1.as_ref().unwrap().len(), 3);
    assert!(matches!(
        results[1].1,
        Err(ManagerError::Lookup(ResolveError::UnknownName { .. }))
    ));
}

#[test]
fn remote_descriptor_with_connections_is_refused() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::builder(PluginRegistry::new())
        .with_status_dir(dir.path())
        .build();
    let url = RemoteUrl::parse("tcp://lab-pc:1234/shared_logic").unwrap();
    let desc = ModuleDescriptor::remote(ModuleBase::Logic, "logic1", url)
        .with_connection("counter", "counter");

    let err = manager.add_descriptor(desc).unwrap_err();

    assert!(matches!(
        err,
        ManagerError::Descriptor(DescriptorError::RemoteWithConnections { .. })
    ));
    assert!(!manager.is_defined(&logic("logic1")));
}

#[test]
fn concurrent_starts_of_one_module_activate_it_once() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let yaml = r"
hardware:
  slow:
    module.Class: test.Counter
    load_delay_ms: 200
";
    let manager = manager_with(yaml, &journal, dir.path());

    let other = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.start_module(&hw("slow")))
    };
    let here = manager.start_module(&hw("slow")).unwrap();
    let there = other.join().unwrap().unwrap();

    let mut started = here;
    started.extend(there);
    assert_eq!(started, vec![hw("slow")]);
    assert_eq!(entries(&journal), vec!["activate hardware.slow"]);
    assert_eq!(
        manager.module_state(&hw("slow")).unwrap(),
        Some(ModuleState::Active)
    );
}

#[test]
fn panicking_interfaces_fail_the_connection_instead_of_unwinding() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let yaml = r"
hardware:
  counter:
    module.Class: test.Counter
    panic_in: interfaces
logic:
  logic1:
    module.Class: test.CounterLogic
    connect:
      counter: counter
";
    let manager = manager_with(yaml, &journal, dir.path());

    let err = manager.start_module(&logic("logic1")).unwrap_err();

    let ManagerError::Connection { errors, .. } = err.root() else {
        panic!("expected a connection error, got {err}");
    };
    assert!(matches!(
        errors.as_slice(),
        [ConnectorError::InterfacesUnavailable { connector, .. }] if connector == "counter"
    ));
    assert!(!manager.is_active(&logic("logic1")));
}

#[test]
fn panicking_busy_check_counts_as_idle() {
    let dir = TempDir::new().unwrap();
    let journal = journal();
    let yaml = r"
hardware:
  counter:
    module.Class: test.Counter
    panic_in: is_busy
";
    let manager = manager_with(yaml, &journal, dir.path());
    manager.start_module(&hw("counter")).unwrap();

    assert_eq!(
        manager.module_state(&hw("counter")).unwrap(),
        Some(ModuleState::Active)
    );
    let QuitOutcome::Completed(report) = manager.quit(&|_| false) else {
        panic!("quit must not see a busy module");
    };
    assert_eq!(report.deactivated, vec![hw("counter")]);
    assert!(report.failed.is_empty());
}
