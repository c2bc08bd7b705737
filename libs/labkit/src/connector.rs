//! Connectors: named, typed dependency slots declared by a module class.
//!
//! A connector never owns its target. It keeps a `Weak` back-reference, so a
//! connector whose target went away reports itself as unconnected instead of keeping
//! a dead module alive.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::contracts::{Module, guarded};

/// Static declaration of a connector on a module class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorDecl {
    pub name: String,
    /// Interface identifier the bound module must expose.
    pub interface: String,
    pub optional: bool,
}

impl ConnectorDecl {
    pub fn required(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(name, interface)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector '{connector}' is declared more than once")]
    Duplicate { connector: String },
    #[error("connector '{connector}' is not declared by the module class")]
    Unknown { connector: String },
    #[error(
        "connector '{connector}' requires interface '{interface}', target offers {offered:?}"
    )]
    CapabilityMismatch {
        connector: String,
        interface: String,
        offered: Vec<String>,
    },
    #[error("connector '{connector}' cannot read the target's interfaces: {reason}")]
    InterfacesUnavailable { connector: String, reason: String },
    #[error("connector '{connector}' is not connected")]
    NotConnected { connector: String },
    #[error("mandatory connector '{connector}' is not configured")]
    Missing { connector: String },
    #[error("connector '{connector}' cannot use target '{target}': {reason}")]
    TargetUnavailable {
        connector: String,
        target: String,
        reason: String,
    },
}

/// Runtime connector: a declaration plus the current binding.
pub struct Connector {
    decl: ConnectorDecl,
    target: RwLock<Option<Weak<dyn Module>>>,
}

impl Connector {
    #[must_use]
    pub fn new(decl: ConnectorDecl) -> Self {
        Self {
            decl,
            target: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.decl.interface
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.decl.optional
    }

    /// Bind `target`. The capability check reads `Module::interfaces`, so local
    /// instances and remote proxies are treated alike.
    ///
    /// # Errors
    /// Returns `ConnectorError::CapabilityMismatch` if the target lacks the interface and
    /// `ConnectorError::InterfacesUnavailable` if asking for them panicked.
    /// The previous binding is left untouched in both cases.
    pub fn connect(&self, target: &Arc<dyn Module>) -> Result<(), ConnectorError> {
        let offered = guarded(|| Ok(target.interfaces())).map_err(|e| {
            ConnectorError::InterfacesUnavailable {
                connector: self.decl.name.clone(),
                reason: e.to_string(),
            }
        })?;
        if !offered.iter().any(|i| *i == self.decl.interface) {
            return Err(ConnectorError::CapabilityMismatch {
                connector: self.decl.name.clone(),
                interface: self.decl.interface.clone(),
                offered,
            });
        }
        *self.target.write() = Some(Arc::downgrade(target));
        Ok(())
    }

    pub fn disconnect(&self) {
        self.target.write().take();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.target
            .read()
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// The bound module.
    ///
    /// # Errors
    /// Returns `ConnectorError::NotConnected` if unbound or the target was dropped.
    pub fn get(&self) -> Result<Arc<dyn Module>, ConnectorError> {
        self.target
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ConnectorError::NotConnected {
                connector: self.decl.name.clone(),
            })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("decl", &self.decl)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// All connectors of one module instance, in declaration order.
#[derive(Debug, Default)]
pub struct Connectors {
    slots: IndexMap<String, Connector>,
}

impl Connectors {
    /// # Errors
    /// Returns `ConnectorError::Duplicate` if two declarations share a name.
    pub fn from_decls(decls: &[ConnectorDecl]) -> Result<Self, ConnectorError> {
        let mut slots = IndexMap::with_capacity(decls.len());
        for decl in decls {
            if slots.contains_key(&decl.name) {
                return Err(ConnectorError::Duplicate {
                    connector: decl.name.clone(),
                });
            }
            slots.insert(decl.name.clone(), Connector::new(decl.clone()));
        }
        Ok(Self { slots })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Connector> {
        self.slots.get(name)
    }

    /// Bound module behind connector `name`.
    ///
    /// # Errors
    /// Returns `ConnectorError::Unknown` for undeclared names and
    /// `ConnectorError::NotConnected` for unbound connectors.
    pub fn module(&self, name: &str) -> Result<Arc<dyn Module>, ConnectorError> {
        self.slots
            .get(name)
            .ok_or_else(|| ConnectorError::Unknown {
                connector: name.to_owned(),
            })?
            .get()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connector> {
        self.slots.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Mandatory connectors that are currently unbound.
    #[must_use]
    pub fn unbound_required(&self) -> Vec<String> {
        self.slots
            .values()
            .filter(|c| !c.is_optional() && !c.is_connected())
            .map(|c| c.name().to_owned())
            .collect()
    }

    pub fn disconnect_all(&self) {
        for c in self.slots.values() {
            c.disconnect();
        }
    }
}
