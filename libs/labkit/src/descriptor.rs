//! Module descriptors: the "defined" view of a module, parsed from one leaf of the
//! configuration tree.
//!
//! A descriptor is immutable once ingested. Reconfiguration replaces the whole
//! descriptor (see `Manager::reconfigure_module`), which is why the manager shares
//! descriptors as `Arc<ModuleDescriptor>`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::remote::{RemoteUrl, RemoteUrlError};

/// Configuration key naming the plugin class of a local module.
pub const CLASS_KEY: &str = "module.Class";
const CONNECT_KEY: &str = "connect";
const REMOTE_KEY: &str = "remote";
const REMOTE_ACCESS_KEY: &str = "remoteaccess";
const CERT_FILE_KEY: &str = "certfile";
const KEY_FILE_KEY: &str = "keyfile";
const CA_FILE_KEY: &str = "cafile";

/// Category of a module. Used for namespacing and for load-order conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleBase {
    Hardware,
    Logic,
    Gui,
}

impl ModuleBase {
    pub const ALL: [ModuleBase; 3] = [ModuleBase::Hardware, ModuleBase::Logic, ModuleBase::Gui];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ModuleBase::Hardware => "hardware",
            ModuleBase::Logic => "logic",
            ModuleBase::Gui => "gui",
        }
    }

    const fn index(self) -> usize {
        match self {
            ModuleBase::Hardware => 0,
            ModuleBase::Logic => 1,
            ModuleBase::Gui => 2,
        }
    }
}

impl fmt::Display for ModuleBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown module base '{0}' (expected hardware, logic or gui)")]
pub struct UnknownBase(pub String);

impl FromStr for ModuleBase {
    type Err = UnknownBase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardware" => Ok(ModuleBase::Hardware),
            "logic" => Ok(ModuleBase::Logic),
            "gui" => Ok(ModuleBase::Gui),
            other => Err(UnknownBase(other.to_owned())),
        }
    }
}

/// Fully qualified module identity: `(base, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId {
    pub base: ModuleBase,
    pub name: String,
}

impl ModuleId {
    pub fn new(base: ModuleBase, name: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
        }
    }

    /// Name of the dedicated worker thread of this module.
    #[must_use]
    pub fn thread_name(&self) -> String {
        format!("mod-{}-{}", self.base, self.name)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.base, self.name)
    }
}

/// One map per base, each preserving insertion order.
#[derive(Debug, Clone)]
pub struct BaseMap<T> {
    slots: [IndexMap<String, T>; 3],
}

impl<T> Default for BaseMap<T> {
    fn default() -> Self {
        Self {
            slots: [IndexMap::new(), IndexMap::new(), IndexMap::new()],
        }
    }
}

impl<T> BaseMap<T> {
    #[must_use]
    pub fn base(&self, base: ModuleBase) -> &IndexMap<String, T> {
        &self.slots[base.index()]
    }

    pub fn base_mut(&mut self, base: ModuleBase) -> &mut IndexMap<String, T> {
        &mut self.slots[base.index()]
    }

    #[must_use]
    pub fn get(&self, id: &ModuleId) -> Option<&T> {
        self.base(id.base).get(&id.name)
    }

    pub fn get_mut(&mut self, id: &ModuleId) -> Option<&mut T> {
        self.base_mut(id.base).get_mut(&id.name)
    }

    #[must_use]
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.base(id.base).contains_key(&id.name)
    }

    pub fn insert(&mut self, id: &ModuleId, value: T) -> Option<T> {
        self.base_mut(id.base).insert(id.name.clone(), value)
    }

    /// Removes an entry keeping the order of the remaining ones.
    pub fn remove(&mut self, id: &ModuleId) -> Option<T> {
        self.base_mut(id.base).shift_remove(&id.name)
    }

    /// Bases that hold a module called `name`.
    #[must_use]
    pub fn bases_of(&self, name: &str) -> Vec<ModuleBase> {
        ModuleBase::ALL
            .into_iter()
            .filter(|b| self.base(*b).contains_key(name))
            .collect()
    }

    /// All entries, hardware first, then logic, then gui.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &T)> {
        ModuleBase::ALL.into_iter().flat_map(move |base| {
            self.base(base)
                .iter()
                .map(move |(name, v)| (ModuleId::new(base, name.clone()), v))
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.iter().map(|(id, _)| id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().map(IndexMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors raised while turning a configuration leaf into a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("module '{module}' definition must be a mapping")]
    NotAMapping { module: String },
    #[error("module '{module}' declares neither 'module.Class' nor 'remote'")]
    MissingClass { module: String },
    #[error("module '{module}' has a malformed 'connect' map: {reason}")]
    MalformedConnect { module: String, reason: String },
    #[error("module '{module}' has an invalid '{key}' value: expected {expected}")]
    InvalidValue {
        module: String,
        key: &'static str,
        expected: &'static str,
    },
    #[error("module '{module}' is remote and cannot declare connections; its server wires it")]
    RemoteWithConnections { module: String },
    #[error("module '{module}' has an invalid remote url: {source}")]
    InvalidRemoteUrl {
        module: String,
        #[source]
        source: RemoteUrlError,
    },
}

/// Declarative description of a module as found in the "defined" tier.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub base: ModuleBase,
    /// `<package>.<ClassName>` key into the plugin registry. `None` for remote-only modules.
    pub class_path: Option<String>,
    /// Free-form options handed to the module.
    pub options: Map<String, Value>,
    /// Connector name -> target module name.
    pub connections: IndexMap<String, String>,
    pub remote_url: Option<RemoteUrl>,
    pub remote_access: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl ModuleDescriptor {
    /// Descriptor of a locally instantiated module.
    pub fn local(base: ModuleBase, name: impl Into<String>, class_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base,
            class_path: Some(class_path.into()),
            options: Map::new(),
            connections: IndexMap::new(),
            remote_url: None,
            remote_access: false,
            cert_file: None,
            key_file: None,
            ca_file: None,
        }
    }

    /// Descriptor of a module hosted by a remote server.
    pub fn remote(base: ModuleBase, name: impl Into<String>, url: RemoteUrl) -> Self {
        Self {
            class_path: None,
            remote_url: Some(url),
            ..Self::local(base, name, String::new())
        }
    }

    #[must_use]
    pub fn with_connection(mut self, connector: impl Into<String>, target: impl Into<String>) -> Self {
        self.connections.insert(connector.into(), target.into());
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_remote_access(mut self, enabled: bool) -> Self {
        self.remote_access = enabled;
        self
    }

    #[must_use]
    pub fn id(&self) -> ModuleId {
        ModuleId::new(self.base, self.name.clone())
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.remote_url.is_some()
    }

    /// Last segment of the class path; used to name status files.
    #[must_use]
    pub fn class_name(&self) -> Option<&str> {
        self.class_path
            .as_deref()
            .map(|p| p.rsplit('.').next().unwrap_or(p))
    }

    /// Parse one `hardware`/`logic`/`gui` leaf of the configuration tree.
    ///
    /// Known keys are lifted into typed fields, everything else becomes a free-form option.
    /// A leaf carrying both `remote` and `module.Class` is treated as remote.
    ///
    /// # Errors
    /// Returns `DescriptorError` when the leaf is not a mapping, declares no class and no
    /// remote url, or when a known key has the wrong shape.
    pub fn from_config(base: ModuleBase, name: &str, leaf: &Value) -> Result<Self, DescriptorError> {
        let module = format!("{base}.{name}");
        let obj = leaf
            .as_object()
            .ok_or_else(|| DescriptorError::NotAMapping {
                module: module.clone(),
            })?;

        let mut desc = Self::local(base, name, String::new());
        desc.class_path = None;

        for (key, value) in obj {
            match key.as_str() {
                CLASS_KEY => {
                    let class = value.as_str().ok_or_else(|| DescriptorError::InvalidValue {
                        module: module.clone(),
                        key: CLASS_KEY,
                        expected: "a string",
                    })?;
                    desc.class_path = Some(class.to_owned());
                }
                CONNECT_KEY => desc.connections = parse_connect(&module, value)?,
                REMOTE_KEY => {
                    let raw = value.as_str().ok_or_else(|| DescriptorError::InvalidValue {
                        module: module.clone(),
                        key: REMOTE_KEY,
                        expected: "a url string",
                    })?;
                    let url = RemoteUrl::parse(raw).map_err(|source| {
                        DescriptorError::InvalidRemoteUrl {
                            module: module.clone(),
                            source,
                        }
                    })?;
                    desc.remote_url = Some(url);
                }
                REMOTE_ACCESS_KEY => {
                    desc.remote_access =
                        value.as_bool().ok_or_else(|| DescriptorError::InvalidValue {
                            module: module.clone(),
                            key: REMOTE_ACCESS_KEY,
                            expected: "a boolean",
                        })?;
                }
                CERT_FILE_KEY => desc.cert_file = parse_path(&module, CERT_FILE_KEY, value)?,
                KEY_FILE_KEY => desc.key_file = parse_path(&module, KEY_FILE_KEY, value)?,
                CA_FILE_KEY => desc.ca_file = parse_path(&module, CA_FILE_KEY, value)?,
                _ => {
                    desc.options.insert(key.clone(), value.clone());
                }
            }
        }

        match (&desc.class_path, &desc.remote_url) {
            (None, None) => return Err(DescriptorError::MissingClass { module }),
            (Some(class), Some(url)) => {
                tracing::warn!(
                    module = %module,
                    class = %class,
                    remote = %url,
                    "Module declares both a class and a remote url; using the remote url"
                );
                desc.class_path = None;
            }
            _ => {}
        }

        desc.validate()?;
        Ok(desc)
    }

    /// Checks that hold for every descriptor, however it was built.
    ///
    /// # Errors
    /// Returns `DescriptorError::RemoteWithConnections` for a remote module with a
    /// `connect` map.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.is_remote() && !self.connections.is_empty() {
            return Err(DescriptorError::RemoteWithConnections {
                module: self.id().to_string(),
            });
        }
        Ok(())
    }
}

fn parse_connect(module: &str, value: &Value) -> Result<IndexMap<String, String>, DescriptorError> {
    let malformed = |reason: String| DescriptorError::MalformedConnect {
        module: module.to_owned(),
        reason,
    };
    match value {
        Value::Null => Ok(IndexMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(connector, target)| {
                let target = target.as_str().ok_or_else(|| {
                    malformed(format!("target of connector '{connector}' must be a module name"))
                })?;
                if target.is_empty() {
                    return Err(malformed(format!("connector '{connector}' has an empty target")));
                }
                Ok((connector.clone(), target.to_owned()))
            })
            .collect(),
        _ => Err(malformed("expected a mapping of connector -> module".to_owned())),
    }
}

fn parse_path(
    module: &str,
    key: &'static str,
    value: &Value,
) -> Result<Option<PathBuf>, DescriptorError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(PathBuf::from(s))),
        _ => Err(DescriptorError::InvalidValue {
            module: module.to_owned(),
            key,
            expected: "a path string",
        }),
    }
}
