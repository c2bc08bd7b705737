use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_HOME_SUBDIR: &str = ".labkit";

#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("cannot locate the user home directory ({var} is not set)")]
    HomeMissing { var: &'static str },
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("cannot create home_dir {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn user_home() -> Result<PathBuf, HomeDirError> {
    #[cfg(target_os = "windows")]
    let home = env::var_os("USERPROFILE").or_else(|| env::var_os("HOME"));
    #[cfg(not(target_os = "windows"))]
    let home = env::var_os("HOME");

    home.map(PathBuf::from)
        .ok_or(HomeDirError::HomeMissing { var: "HOME" })
}

/// Expand a leading `~` (alone, or followed by a separator) to the user home.
/// `~user` forms are left untouched.
///
/// # Errors
/// Returns `HomeDirError::HomeMissing` when expansion is needed but no home is known.
pub fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    match raw
        .strip_prefix("~/")
        .or_else(|| raw.strip_prefix("~\\"))
    {
        Some(rest) => Ok(user_home()?.join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

/// Resolve the process home directory.
///
/// A configured value is tilde-expanded and must end up absolute. Without one,
/// `<user home>/<default_subdir>` is used. With `create` the directory is created
/// when missing.
///
/// # Errors
/// Returns `HomeDirError` for relative paths, an unknown user home, or a failed
/// directory creation.
pub fn resolve_home_dir(
    configured: Option<&str>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match configured {
        Some(raw) => {
            let expanded = expand_tilde(raw)?;
            if !expanded.is_absolute() {
                return Err(HomeDirError::AbsoluteRequired(
                    expanded.to_string_lossy().into_owned(),
                ));
            }
            expanded
        }
        None => user_home()?.join(default_subdir),
    };

    if create {
        ensure_dir(&path)?;
    }
    Ok(path)
}

fn ensure_dir(path: &Path) -> Result<(), HomeDirError> {
    fs::create_dir_all(path).map_err(|source| HomeDirError::Create {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn tilde_prefix_is_expanded() {
        let tmp = tempdir().unwrap();
        temp_env::with_var("HOME", Some(tmp.path()), || {
            assert_eq!(expand_tilde("~").unwrap(), tmp.path());
            assert_eq!(
                expand_tilde("~/lab/status").unwrap(),
                tmp.path().join("lab/status")
            );
        });
    }

    #[test]
    fn paths_without_tilde_are_kept() {
        assert_eq!(
            expand_tilde("/opt/labkit").unwrap(),
            PathBuf::from("/opt/labkit")
        );
        assert_eq!(expand_tilde("~alice/x").unwrap(), PathBuf::from("~alice/x"));
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn default_home_is_created_under_user_home() {
        let tmp = tempdir().unwrap();
        temp_env::with_var("HOME", Some(tmp.path()), || {
            let home = resolve_home_dir(None, DEFAULT_HOME_SUBDIR, true).unwrap();
            assert_eq!(home, tmp.path().join(".labkit"));
            assert!(home.is_dir());
        });
    }

    #[test]
    fn configured_home_must_be_absolute() {
        let err = resolve_home_dir(Some("relative/home"), DEFAULT_HOME_SUBDIR, false).unwrap_err();
        assert!(matches!(err, HomeDirError::AbsoluteRequired(p) if p == "relative/home"));
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn missing_user_home_is_reported() {
        temp_env::with_var_unset("HOME", || {
            let err = resolve_home_dir(None, DEFAULT_HOME_SUBDIR, false).unwrap_err();
            assert!(matches!(err, HomeDirError::HomeMissing { .. }));
        });
    }
}
