use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a loaded module.
///
/// `Locked` is never stored: it is how an `Active` module reporting `is_busy()` is
/// shown to callers. `Broken` is left only by unloading the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Loaded, connectors unbound.
    Deactivated,
    /// Loaded, every mandatory connector bound.
    Connected,
    Activating,
    Active,
    Locked,
    Deactivating,
    Broken,
}

impl ModuleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ModuleState::Deactivated => "deactivated",
            ModuleState::Connected => "connected",
            ModuleState::Activating => "activating",
            ModuleState::Active => "active",
            ModuleState::Locked => "locked",
            ModuleState::Deactivating => "deactivating",
            ModuleState::Broken => "broken",
        }
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, ModuleState::Active | ModuleState::Locked)
    }

    /// Whether the stored state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: ModuleState) -> bool {
        matches!(
            (self, next),
            (ModuleState::Deactivated, ModuleState::Connected)
                | (ModuleState::Connected, ModuleState::Deactivated | ModuleState::Activating)
                | (
                    ModuleState::Activating,
                    ModuleState::Active | ModuleState::Broken
                )
                | (ModuleState::Active, ModuleState::Deactivating)
                | (
                    ModuleState::Deactivating,
                    ModuleState::Deactivated | ModuleState::Broken
                )
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
