//! Remote-module seam of the core.
//!
//! The core never opens sockets itself. It knows how to describe a remote module
//! (`RemoteUrl` + `TlsFiles`), how to remember which local modules are shared
//! (`ShareTable`) and how to ask a pluggable `RemoteModuleConnector` for a proxy.
//! The network implementation lives in the `labkit-remote` crate.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use url::Url;

use crate::contracts::Module;
use crate::descriptor::{ModuleBase, ModuleDescriptor};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RemoteUrlError {
    #[error("cannot parse '{url}': {reason}")]
    Parse { url: String, reason: String },
    #[error("'{url}' has no host")]
    MissingHost { url: String },
    #[error("'{url}' has no port")]
    MissingPort { url: String },
    #[error("'{url}' must name exactly one shared module in its path")]
    MissingModuleName { url: String },
}

/// `scheme://host:port/module_name` locator of a shared module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    raw: String,
    scheme: String,
    host: String,
    port: u16,
    module_name: String,
}

impl RemoteUrl {
    /// # Errors
    /// Returns `RemoteUrlError` when the url has no host, no port or no single path segment.
    pub fn parse(raw: &str) -> Result<Self, RemoteUrlError> {
        let url = Url::parse(raw).map_err(|e| RemoteUrlError::Parse {
            url: raw.to_owned(),
            reason: e.to_string(),
        })?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RemoteUrlError::MissingHost {
                url: raw.to_owned(),
            })?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RemoteUrlError::MissingPort {
                url: raw.to_owned(),
            })?;
        let module_name = url.path().trim_matches('/');
        if module_name.is_empty() || module_name.contains('/') {
            return Err(RemoteUrlError::MissingModuleName {
                url: raw.to_owned(),
            });
        }

        Ok(Self {
            raw: raw.to_owned(),
            scheme: url.scheme().to_owned(),
            host: host.to_owned(),
            port,
            module_name: module_name.to_owned(),
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Name under which the module is shared on the remote server.
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Certificate material for a mutually authenticated channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Trust anchor for the peer. Falls back to `cert_file` when absent.
    pub ca_file: Option<PathBuf>,
}

impl TlsFiles {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: None,
        }
    }

    #[must_use]
    pub fn with_ca_file(mut self, ca_file: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(ca_file.into());
        self
    }

    #[must_use]
    pub fn trust_anchor(&self) -> &Path {
        self.ca_file.as_deref().unwrap_or(&self.cert_file)
    }

    /// TLS settings of a descriptor, if both cert and key are configured.
    #[must_use]
    pub fn from_descriptor(desc: &ModuleDescriptor) -> Option<Self> {
        match (&desc.cert_file, &desc.key_file) {
            (Some(cert), Some(key)) => Some(Self {
                cert_file: cert.clone(),
                key_file: key.clone(),
                ca_file: desc.ca_file.clone(),
            }),
            _ => None,
        }
    }
}

/// Client side of the remote seam: turns a url into a module proxy.
///
/// Implementations must surface every network or authentication failure as an error;
/// they never hand back a placeholder object.
pub trait RemoteModuleConnector: Send + Sync {
    /// # Errors
    /// Returns an error if the server cannot be reached, refuses the peer, or does not
    /// share the requested module.
    fn connect(&self, url: &RemoteUrl, tls: Option<&TlsFiles>) -> anyhow::Result<Arc<dyn Module>>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("a module named '{name}' is already shared (from {base})")]
    AlreadyShared { name: String, base: ModuleBase },
}

struct ShareEntry {
    base: ModuleBase,
    module: Weak<ModuleDescriptor>,
}

/// Process-wide table of shared modules, keyed by module name.
///
/// Entries hold weak references to the defined module; a record whose module has been
/// dropped from the defined tier is pruned on the next access.
#[derive(Default)]
pub struct ShareTable {
    entries: DashMap<String, ShareEntry>,
}

impl ShareTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share `module` under its name.
    ///
    /// Re-sharing the same live module is a no-op.
    ///
    /// # Errors
    /// Returns `ShareError::AlreadyShared` if a different live module holds the name.
    pub fn share(&self, module: &Arc<ModuleDescriptor>) -> Result<(), ShareError> {
        self.prune();
        if let Some(existing) = self.entries.get(&module.name)
            && let Some(live) = existing.module.upgrade()
            && !Arc::ptr_eq(&live, module)
        {
            return Err(ShareError::AlreadyShared {
                name: module.name.clone(),
                base: existing.base,
            });
        }
        self.entries.insert(
            module.name.clone(),
            ShareEntry {
                base: module.base,
                module: Arc::downgrade(module),
            },
        );
        Ok(())
    }

    /// Remove a share record. Returns whether a record existed.
    pub fn unshare(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Live shared module by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        let live = self.entries.get(name).and_then(|e| e.module.upgrade());
        if live.is_none() {
            self.entries.remove(name);
        }
        live
    }

    #[must_use]
    pub fn is_shared(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names of all live shares, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.prune();
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn prune(&self) {
        self.entries.retain(|_, e| e.module.strong_count() > 0);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_module_name() {
        let url = RemoteUrl::parse("rpyc://lab-pc:12345/shared_counter").unwrap();
        assert_eq!(url.scheme(), "rpyc");
        assert_eq!(url.host(), "lab-pc");
        assert_eq!(url.port(), 12345);
        assert_eq!(url.module_name(), "shared_counter");
        assert_eq!(url.to_string(), "rpyc://lab-pc:12345/shared_counter");
    }

    #[test]
    fn rejects_urls_without_port_or_name() {
        assert!(matches!(
            RemoteUrl::parse("rpyc://lab-pc/x"),
            Err(RemoteUrlError::MissingPort { .. })
        ));
        assert!(matches!(
            RemoteUrl::parse("rpyc://lab-pc:1234/"),
            Err(RemoteUrlError::MissingModuleName { .. })
        ));
        assert!(matches!(
            RemoteUrl::parse("not a url"),
            Err(RemoteUrlError::Parse { .. })
        ));
    }

    #[test]
    fn share_entries_do_not_keep_modules_alive() {
        let table = ShareTable::new();
        let desc = Arc::new(ModuleDescriptor::local(ModuleBase::Hardware, "counter", "a.B"));
        table.share(&desc).unwrap();
        assert_eq!(table.names(), vec!["counter".to_owned()]);

        drop(desc);
        assert!(table.get("counter").is_none());
        assert!(table.names().is_empty());
    }

    #[test]
    fn one_entry_per_name() {
        let table = ShareTable::new();
        let hw = Arc::new(ModuleDescriptor::local(ModuleBase::Hardware, "dup", "a.B"));
        let logic = Arc::new(ModuleDescriptor::local(ModuleBase::Logic, "dup", "a.C"));
        table.share(&hw).unwrap();
        table.share(&hw).unwrap();

        let err = table.share(&logic).unwrap_err();
        assert_eq!(
            err,
            ShareError::AlreadyShared {
                name: "dup".to_owned(),
                base: ModuleBase::Hardware
            }
        );

        assert!(table.unshare("dup"));
        assert!(!table.unshare("dup"));
        table.share(&logic).unwrap();
    }

    #[test]
    fn tls_trust_anchor_falls_back_to_cert() {
        let tls = TlsFiles::new("/etc/lab/cert.pem", "/etc/lab/key.pem");
        assert_eq!(tls.trust_anchor(), Path::new("/etc/lab/cert.pem"));
        let tls = tls.with_ca_file("/etc/lab/ca.pem");
        assert_eq!(tls.trust_anchor(), Path::new("/etc/lab/ca.pem"));
    }
}
