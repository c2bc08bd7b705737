//! On-disk store of per-module status variables.
//!
//! One JSON file per `(class_name, base, instance_name)` triple, named
//! `status-{Class}_{base}_{name}.json`, under `<home>/app_status/`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::contracts::StatusVariables;
use crate::descriptor::ModuleBase;

/// Directory below the application home that holds status files.
pub const STATUS_DIR_NAME: &str = "app_status";

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("failed to read status file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write status file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("status file {path} is not a flat JSON object: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store at `<home>/app_status`.
    #[must_use]
    pub fn under_home(home: &Path) -> Self {
        Self::new(home.join(STATUS_DIR_NAME))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn file_path(&self, class_name: &str, base: ModuleBase, name: &str) -> PathBuf {
        self.dir
            .join(format!("status-{class_name}_{base}_{name}.json"))
    }

    /// Load variables. A missing file yields an empty map.
    ///
    /// # Errors
    /// Returns `StatusError` if the file exists but cannot be read or parsed.
    pub fn load(
        &self,
        class_name: &str,
        base: ModuleBase,
        name: &str,
    ) -> Result<StatusVariables, StatusError> {
        let path = self.file_path(class_name, base, name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StatusVariables::new());
            }
            Err(source) => return Err(StatusError::Read { path, source }),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(vars)) => Ok(vars),
            Ok(_) => Err(StatusError::Corrupt {
                path,
                reason: "top level is not an object".to_owned(),
            }),
            Err(e) => Err(StatusError::Corrupt {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Persist variables atomically. Empty maps are not written.
    ///
    /// # Errors
    /// Returns `StatusError::Write` if the directory or file cannot be written.
    pub fn save(
        &self,
        class_name: &str,
        base: ModuleBase,
        name: &str,
        vars: &StatusVariables,
    ) -> Result<(), StatusError> {
        if vars.is_empty() {
            return Ok(());
        }
        let path = self.file_path(class_name, base, name);
        let write_err = |source| StatusError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(write_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        let body = serde_json::to_vec_pretty(vars).map_err(|e| write_err(e.into()))?;
        tmp.write_all(&body).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;
        tracing::debug!(path = %path.display(), count = vars.len(), "Saved status variables");
        Ok(())
    }

    #[must_use]
    pub fn exists(&self, class_name: &str, base: ModuleBase, name: &str) -> bool {
        self.file_path(class_name, base, name).is_file()
    }

    /// Delete the status file. Returns whether a file was removed.
    ///
    /// # Errors
    /// Returns `StatusError::Write` if an existing file cannot be removed.
    pub fn clear(&self, class_name: &str, base: ModuleBase, name: &str) -> Result<bool, StatusError> {
        let path = self.file_path(class_name, base, name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StatusError::Write { path, source }),
        }
    }
}
