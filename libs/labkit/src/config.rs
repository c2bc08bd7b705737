//! Module configuration tree.
//!
//! The tree is a YAML document with the top-level keys `hardware`, `logic`, `gui`
//! and `global`. Leaves under the three bases are kept raw here and turned into
//! `ModuleDescriptor`s by the manager, so that one bad leaf is reported for that
//! module only. Unknown top-level keys are carried through untouched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::descriptor::{BaseMap, ModuleBase, ModuleId};

pub const DEFAULT_REMOTE_ADDRESS: &str = "localhost";
pub const DEFAULT_REMOTE_PORT: u16 = 12345;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {reason}")]
    Yaml { reason: String },
    #[error("config root must be a mapping")]
    NotAMapping,
    #[error("'{section}' section must be a mapping of module name -> definition")]
    InvalidSection { section: String },
    #[error("invalid 'global' section: {source}")]
    InvalidGlobal {
        #[source]
        source: serde_json::Error,
    },
}

/// Settings of the process-wide remote module server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteServerConfig {
    pub address: String,
    pub port: u16,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_REMOTE_ADDRESS.to_owned(),
            port: DEFAULT_REMOTE_PORT,
            certfile: None,
            keyfile: None,
            cafile: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Module names started by `Manager::start_startup_modules`, in order.
    pub startup: Vec<String>,
    pub remote_modules_server: Option<RemoteServerConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    /// Raw module leaves per base, in document order.
    pub modules: BaseMap<Value>,
    pub global: GlobalConfig,
    /// Top-level keys other than the bases and `global`.
    pub extra: Map<String, Value>,
}

impl ConfigTree {
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns `ConfigError` if the text is not valid YAML or has the wrong shape.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_saphyr::from_str(raw).map_err(|e| ConfigError::Yaml {
            reason: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// # Errors
    /// Returns `ConfigError` if the value does not have the expected shape.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let mut root = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(root) => root,
            _ => return Err(ConfigError::NotAMapping),
        };

        let mut tree = Self::default();
        for base in ModuleBase::ALL {
            match root.shift_remove(base.as_str()) {
                None | Some(Value::Null) => {}
                Some(Value::Object(section)) => {
                    for (name, leaf) in section {
                        tree.modules.insert(&ModuleId::new(base, name), leaf);
                    }
                }
                Some(_) => {
                    return Err(ConfigError::InvalidSection {
                        section: base.as_str().to_owned(),
                    });
                }
            }
        }

        tree.global = match root.shift_remove("global") {
            None | Some(Value::Null) => GlobalConfig::default(),
            Some(global) => serde_json::from_value(global)
                .map_err(|source| ConfigError::InvalidGlobal { source })?,
        };
        tree.extra = root;
        Ok(tree)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
global:
  startup: [gui1]
  remote_modules_server:
    address: 0.0.0.0
    port: 12346
  module_server_timeout: 3

hardware:
  counter:
    module.Class: dummy.CounterHardware
    clock_frequency: 100

logic:
  logic1:
    module.Class: dummy.CounterLogic
    connect:
      counter: counter

gui:
  gui1:
    module.Class: dummy.CounterPanel
    connect:
      logic: logic1

notes:
  owner: lab-3
";

    #[test]
    fn parses_bases_global_and_passthrough() {
        let tree = ConfigTree::from_yaml_str(SAMPLE).unwrap();

        let names: Vec<String> = tree.modules.ids().map(|id| id.to_string()).collect();
        assert_eq!(names, vec!["hardware.counter", "logic.logic1", "gui.gui1"]);

        assert_eq!(tree.global.startup, vec!["gui1".to_owned()]);
        let server = tree.global.remote_modules_server.unwrap();
        assert_eq!(server.address, "0.0.0.0");
        assert_eq!(server.port, 12346);
        assert!(server.certfile.is_none());
        assert!(tree.global.extra.contains_key("module_server_timeout"));
        assert!(tree.extra.contains_key("notes"));
    }

    #[test]
    fn empty_document_is_an_empty_tree() {
        let tree = ConfigTree::from_yaml_str("   \n").unwrap();
        assert!(tree.modules.is_empty());
        assert!(tree.global.startup.is_empty());
    }

    #[test]
    fn base_sections_must_be_mappings() {
        let err = ConfigTree::from_yaml_str("hardware: [a, b]\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSection { .. }));
    }

    #[test]
    fn remote_server_defaults() {
        let cfg = RemoteServerConfig::default();
        assert_eq!(cfg.address, "localhost");
        assert_eq!(cfg.port, 12345);
    }
}
