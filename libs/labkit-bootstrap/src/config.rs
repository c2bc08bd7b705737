//! Layered application configuration.
//!
//! Order of precedence, lowest first: built-in defaults, the `server`, `logging` and
//! `threads` sections of the YAML file, `LABKIT__SECTION__KEY` environment variables,
//! then command line overrides. The module tree (`hardware`/`logic`/`gui`/`global`)
//! of the same file is read separately by `labkit::ConfigTree`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::paths::{DEFAULT_HOME_SUBDIR, resolve_home_dir};

pub const ENV_PREFIX: &str = "LABKIT__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root for status files and logs. `~` is expanded.
    pub home_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            home_dir: format!("~/{DEFAULT_HOME_SUBDIR}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
    /// Log file; relative paths live under `home_dir`.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    /// How long quit waits for each module thread.
    pub join_timeout_ms: u64,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 5000,
        }
    }
}

impl ThreadsConfig {
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub threads: ThreadsConfig,
}

/// Command line values that take precedence over every other layer.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub home_dir: Option<String>,
    /// `-v` count: 1 info, 2 debug, 3+ trace.
    pub verbose: u8,
}

impl AppConfig {
    /// Merge defaults, the optional YAML file and the environment.
    /// `server.home_dir` is normalized to an absolute path but not created.
    ///
    /// # Errors
    /// Returns an error if the file is missing or malformed, a value has the wrong
    /// type, or the home directory cannot be resolved.
    pub fn load_layered(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            anyhow::ensure!(
                path.is_file(),
                "config file does not exist: {}",
                path.display()
            );
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .context("invalid application configuration")?;
        config.normalize_home_dir(false)?;
        Ok(config)
    }

    /// [`AppConfig::load_layered`], then create the home directory.
    ///
    /// # Errors
    /// See [`AppConfig::load_layered`]; also fails if the home directory cannot be created.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::load_layered(path)?;
        config.normalize_home_dir(true)?;
        Ok(config)
    }

    fn normalize_home_dir(&mut self, create: bool) -> anyhow::Result<()> {
        let resolved = resolve_home_dir(Some(&self.server.home_dir), DEFAULT_HOME_SUBDIR, create)
            .context("invalid server.home_dir")?;
        self.server.home_dir = resolved.to_string_lossy().into_owned();
        Ok(())
    }

    /// Apply command line overrides. A changed `home_dir` is normalized again.
    ///
    /// # Errors
    /// Returns an error if the overriding home directory cannot be resolved.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) -> anyhow::Result<()> {
        if let Some(home) = &args.home_dir {
            self.server.home_dir.clone_from(home);
            self.normalize_home_dir(true)?;
        }
        let level = match args.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        };
        if let Some(level) = level {
            level.clone_into(&mut self.logging.level);
        }
        Ok(())
    }

    #[must_use]
    pub fn home_dir(&self) -> &Path {
        Path::new(&self.server.home_dir)
    }

    /// Render the effective configuration as YAML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_saphyr::to_string(self).context("cannot render configuration as YAML")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("labkit.yaml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let tmp = TempDir::new().unwrap();
        temp_env::with_vars(
            [
                ("HOME", Some(tmp.path().as_os_str())),
                ("LABKIT__LOGGING__LEVEL", None),
                ("LABKIT__SERVER__HOME_DIR", None),
            ],
            || {
                let config = AppConfig::load_layered(None).unwrap();
                assert_eq!(config.home_dir(), tmp.path().join(".labkit"));
                assert_eq!(config.logging, LoggingConfig::default());
                assert_eq!(config.threads.join_timeout(), Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn file_sections_are_read_next_to_the_module_tree() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("lab-home");
        let path = write_config(
            &tmp,
            &format!(
                r"
server:
  home_dir: {}
logging:
  level: debug
  format: json
  file: logs/labkit.log
threads:
  join_timeout_ms: 250
hardware:
  counter:
    module.Class: dummy.CounterHardware
",
                home.display()
            ),
        );

        temp_env::with_var_unset("LABKIT__LOGGING__LEVEL", || {
            let config = AppConfig::load_or_default(Some(&path)).unwrap();
            assert_eq!(config.home_dir(), home);
            assert!(home.is_dir());
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.logging.file, Some(PathBuf::from("logs/labkit.log")));
            assert_eq!(config.threads.join_timeout_ms, 250);
        });
    }

    #[test]
    fn environment_overrides_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            &format!(
                "server:\n  home_dir: {}\nlogging:\n  level: debug\n",
                tmp.path().display()
            ),
        );

        temp_env::with_var("LABKIT__LOGGING__LEVEL", Some("warn"), || {
            let config = AppConfig::load_layered(Some(&path)).unwrap();
            assert_eq!(config.logging.level, "warn");
        });
    }

    #[test]
    fn cli_verbosity_raises_the_level() {
        let mut config = AppConfig::default();
        config
            .apply_cli_overrides(&CliArgs {
                verbose: 2,
                ..CliArgs::default()
            })
            .unwrap();
        assert_eq!(config.logging.level, "debug");

        config
            .apply_cli_overrides(&CliArgs {
                verbose: 7,
                ..CliArgs::default()
            })
            .unwrap();
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AppConfig::load_layered(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "threads:\n  join_timeout_ms: soon\n");
        assert!(AppConfig::load_layered(Some(&path)).is_err());
    }

    #[test]
    fn yaml_dump_contains_every_section() {
        let yaml = AppConfig::default().to_yaml().unwrap();
        for key in ["server", "home_dir", "logging", "threads", "join_timeout_ms"] {
            assert!(yaml.contains(key), "{key} missing from:\n{yaml}");
        }
    }
}
