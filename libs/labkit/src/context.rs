//! Per-activation context handed to `Module::on_activate`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::connector::{ConnectorError, Connectors};
use crate::contracts::{Module, StatusVariables};
use crate::descriptor::ModuleId;

/// Error returned by typed option access.
#[derive(thiserror::Error, Debug)]
pub enum OptionsError {
    #[error("invalid options for module '{module}': {source}")]
    Invalid {
        module: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing option '{key}' for module '{module}'")]
    Missing { module: String, key: String },
}

/// Read-only view of everything a module needs while activating: its identity,
/// free-form options, bound connectors and restored status variables.
#[derive(Clone)]
pub struct ModuleCtx {
    id: ModuleId,
    options: Arc<Map<String, Value>>,
    connectors: Arc<Connectors>,
    status_variables: StatusVariables,
}

impl ModuleCtx {
    #[must_use]
    pub fn new(
        id: ModuleId,
        options: Arc<Map<String, Value>>,
        connectors: Arc<Connectors>,
        status_variables: StatusVariables,
    ) -> Self {
        Self {
            id,
            options,
            connectors,
            status_variables,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    #[must_use]
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    #[must_use]
    pub fn connectors(&self) -> &Arc<Connectors> {
        &self.connectors
    }

    /// Status variables restored from disk. Empty on first activation.
    #[must_use]
    pub fn status_variables(&self) -> &StatusVariables {
        &self.status_variables
    }

    /// Bound module behind connector `name`.
    ///
    /// # Errors
    /// Returns `ConnectorError` if the connector is undeclared or unbound.
    pub fn connected(&self, name: &str) -> Result<Arc<dyn Module>, ConnectorError> {
        self.connectors.module(name)
    }

    /// Lenient typed view of the module options: missing keys fall back to `T::default()`
    /// through serde defaults.
    ///
    /// # Errors
    /// Returns `OptionsError::Invalid` if present options cannot be deserialized.
    pub fn config<T: DeserializeOwned + Default>(&self) -> Result<T, OptionsError> {
        if self.options.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_value(Value::Object((*self.options).clone())).map_err(|source| {
            OptionsError::Invalid {
                module: self.id.to_string(),
                source,
            }
        })
    }

    /// Strict single-option access.
    ///
    /// # Errors
    /// Returns `OptionsError::Missing` if the key is absent, `OptionsError::Invalid` if it
    /// has the wrong type.
    pub fn option<T: DeserializeOwned>(&self, key: &str) -> Result<T, OptionsError> {
        let raw = self.options.get(key).ok_or_else(|| OptionsError::Missing {
            module: self.id.to_string(),
            key: key.to_owned(),
        })?;
        serde_json::from_value(raw.clone()).map_err(|source| OptionsError::Invalid {
            module: self.id.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for ModuleCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCtx")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("connectors", &self.connectors.len())
            .field("status_variables", &self.status_variables)
            .finish()
    }
}
