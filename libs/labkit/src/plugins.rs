//! Plugin registry: `(base, class_path)` -> module factory.
//!
//! Module crates register their classes at link time:
//!
//! ```ignore
//! labkit::inventory::submit! {
//!     labkit::ModuleRegistration(|registry| {
//!         registry.register(ModuleClass::new(ModuleBase::Hardware, "dummy.CounterHardware", build))
//!     })
//! }
//! ```
//!
//! and the host collects them with [`PluginRegistry::discover`]. Tests usually skip
//! discovery and call [`PluginRegistry::register`] directly.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::connector::ConnectorDecl;
use crate::contracts::{Module, ModuleInit};
use crate::descriptor::ModuleBase;

pub type ModuleFactory = Arc<dyn Fn(&ModuleInit) -> anyhow::Result<Arc<dyn Module>> + Send + Sync>;

/// Everything the manager needs to instantiate one module class.
#[derive(Clone)]
pub struct ModuleClass {
    pub base: ModuleBase,
    pub class_path: String,
    pub connectors: Vec<ConnectorDecl>,
    /// Run activation and deactivation on a dedicated worker thread.
    pub threaded: bool,
    pub factory: ModuleFactory,
}

impl ModuleClass {
    pub fn new<F>(base: ModuleBase, class_path: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ModuleInit) -> anyhow::Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            base,
            class_path: class_path.into(),
            connectors: Vec::new(),
            threaded: false,
            factory: Arc::new(factory),
        }
    }

    #[must_use]
    pub fn with_connector(mut self, decl: ConnectorDecl) -> Self {
        self.connectors.push(decl);
        self
    }

    #[must_use]
    pub fn threaded(mut self) -> Self {
        self.threaded = true;
        self
    }

    /// Short class name, the last segment of the class path.
    #[must_use]
    pub fn class_name(&self) -> &str {
        self.class_path
            .rsplit('.')
            .next()
            .unwrap_or(&self.class_path)
    }
}

impl fmt::Debug for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClass")
            .field("base", &self.base)
            .field("class_path", &self.class_path)
            .field("connectors", &self.connectors)
            .field("threaded", &self.threaded)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("module class '{class_path}' is already registered for {base}")]
    Duplicate { base: ModuleBase, class_path: String },
    #[error("no module class '{class_path}' is registered for {base}")]
    NotFound { base: ModuleBase, class_path: String },
}

/// Link-time registration hook collected by `inventory`.
pub struct ModuleRegistration(pub fn(&mut PluginRegistry) -> Result<(), PluginError>);

inventory::collect!(ModuleRegistration);

#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    classes: IndexMap<(ModuleBase, String), ModuleClass>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry filled from every `ModuleRegistration` linked into the binary.
    ///
    /// # Errors
    /// Returns the first `PluginError::Duplicate` raised by a registration.
    pub fn discover() -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for registration in inventory::iter::<ModuleRegistration> {
            (registration.0)(&mut registry)?;
        }
        tracing::info!(classes = registry.len(), "Discovered module classes");
        Ok(registry)
    }

    /// # Errors
    /// Returns `PluginError::Duplicate` if the `(base, class_path)` pair is taken.
    pub fn register(&mut self, class: ModuleClass) -> Result<(), PluginError> {
        let key = (class.base, class.class_path.clone());
        if self.classes.contains_key(&key) {
            return Err(PluginError::Duplicate {
                base: class.base,
                class_path: class.class_path,
            });
        }
        tracing::debug!(base = %class.base, class = %class.class_path, "Registered module class");
        self.classes.insert(key, class);
        Ok(())
    }

    /// # Errors
    /// Returns `PluginError::NotFound` if nothing is registered under the key.
    pub fn get(&self, base: ModuleBase, class_path: &str) -> Result<&ModuleClass, PluginError> {
        self.classes
            .get(&(base, class_path.to_owned()))
            .ok_or_else(|| PluginError::NotFound {
                base,
                class_path: class_path.to_owned(),
            })
    }

    pub fn classes(&self) -> impl Iterator<Item = &ModuleClass> {
        self.classes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::context::ModuleCtx;
    use std::any::Any;

    struct Nop;

    impl Module for Nop {
        fn interfaces(&self) -> Vec<String> {
            Vec::new()
        }
        fn on_activate(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn on_deactivate(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn nop_class(base: ModuleBase, path: &str) -> ModuleClass {
        ModuleClass::new(base, path, |_init| Ok(Arc::new(Nop) as Arc<dyn Module>))
    }

    #[test]
    fn classes_are_keyed_by_base_and_path() {
        let mut registry = PluginRegistry::new();
        registry
            .register(nop_class(ModuleBase::Hardware, "dummy.Nop").threaded())
            .unwrap();
        registry
            .register(nop_class(ModuleBase::Logic, "dummy.Nop"))
            .unwrap();

        assert!(registry.get(ModuleBase::Hardware, "dummy.Nop").unwrap().threaded);
        assert!(!registry.get(ModuleBase::Logic, "dummy.Nop").unwrap().threaded);
        assert!(matches!(
            registry.get(ModuleBase::Gui, "dummy.Nop"),
            Err(PluginError::NotFound { .. })
        ));
        assert_eq!(
            registry.get(ModuleBase::Logic, "dummy.Nop").unwrap().class_name(),
            "Nop"
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry
            .register(nop_class(ModuleBase::Hardware, "dummy.Nop"))
            .unwrap();
        assert!(matches!(
            registry.register(nop_class(ModuleBase::Hardware, "dummy.Nop")),
            Err(PluginError::Duplicate { .. })
        ));
    }
}
