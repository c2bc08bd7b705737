//! Global `tracing` subscriber for host processes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

/// `RUST_LOG` when set, otherwise the configured level.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))
}

/// Where the log file goes, if any. Relative paths are placed under `home_dir`.
#[must_use]
pub fn log_file_path(config: &LoggingConfig, home_dir: &Path) -> Option<PathBuf> {
    config.file.as_ref().map(|file| {
        if file.is_absolute() {
            file.clone()
        } else {
            home_dir.join(file)
        }
    })
}

/// Install the global subscriber: console output in the configured format plus an
/// optional plain-text file. Keep the returned guard alive until exit so buffered
/// file output is flushed.
///
/// # Errors
/// Returns an error for an invalid level, an unusable log file location, or when a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, home_dir: &Path) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level)?;

    let (text, json) = match config.format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(false))),
    };

    let mut guard = None;
    let file_layer = match log_file_path(config, home_dir) {
        Some(path) => {
            let dir = path.parent().unwrap_or(home_dir);
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let name = path
                .file_name()
                .with_context(|| format!("log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn relative_log_files_live_under_home() {
        let config = LoggingConfig {
            file: Some(PathBuf::from("logs/labkit.log")),
            ..LoggingConfig::default()
        };
        assert_eq!(
            log_file_path(&config, Path::new("/srv/lab")),
            Some(PathBuf::from("/srv/lab/logs/labkit.log"))
        );
    }

    #[test]
    fn absolute_log_files_are_kept() {
        let config = LoggingConfig {
            file: Some(PathBuf::from("/var/log/labkit.log")),
            ..LoggingConfig::default()
        };
        assert_eq!(
            log_file_path(&config, Path::new("/srv/lab")),
            Some(PathBuf::from("/var/log/labkit.log"))
        );
        assert_eq!(log_file_path(&LoggingConfig::default(), Path::new("/srv/lab")), None);
    }

    #[test]
    fn bad_levels_are_rejected() {
        temp_env::with_var_unset("RUST_LOG", || {
            assert!(build_filter("info,labkit=debug").is_ok());
            assert!(build_filter("labkit=loud").is_err());
        });
    }
}
