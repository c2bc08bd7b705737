#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Simulated counting chain for `LabKit`: a photon counter, the logic that samples it
//! and a panel that displays the trace. Useful for demos and end-to-end tests.

pub mod config;
pub mod gui;
pub mod hardware;
pub mod logic;

use labkit::{ModuleRegistration, PluginError, PluginRegistry};

pub use gui::CounterPanel;
pub use hardware::CounterHardware;
pub use logic::CounterLogic;

/// Interface offered by [`CounterHardware`].
pub const SLOW_COUNTER: &str = "slow_counter";
/// Interface offered by [`CounterLogic`].
pub const COUNTER_LOGIC: &str = "counter_logic";
/// Interface offered by [`CounterPanel`].
pub const COUNTER_GUI: &str = "counter_gui";

/// Register every class of this crate.
///
/// # Errors
/// Returns `PluginError::Duplicate` if a class is already registered.
pub fn register(registry: &mut PluginRegistry) -> Result<(), PluginError> {
    registry.register(hardware::class())?;
    registry.register(logic::class())?;
    registry.register(gui::class())?;
    Ok(())
}

inventory::submit! {
    ModuleRegistration(register)
}
