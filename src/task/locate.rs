//! Locating the gpg executable

use crate::config::TaskConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Find the first of `names` in `extra_paths`, then (if `search_path`) in PATH
///
/// A name containing a path separator is taken as a path and only checked for
/// existence.
///
/// # Errors
///
/// [`Error::ExecutableNotFound`] listing the names that were tried.
pub fn find_executable<S: AsRef<str>>(
    names: &[S],
    extra_paths: &[PathBuf],
    search_path: bool,
) -> Result<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    for name in names.iter().map(AsRef::as_ref).filter(|n| !n.is_empty()) {
        if name.contains(std::path::MAIN_SEPARATOR) {
            let path = Path::new(name);
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            continue;
        }

        let existing: Vec<&PathBuf> = extra_paths.iter().filter(|p| p.is_dir()).collect();
        if !existing.is_empty()
            && let Ok(joined) = std::env::join_paths(existing)
            && let Ok(found) = which::which_in(name, Some(joined), &cwd)
        {
            debug!(path = %found.display(), "found executable in configured search paths");
            return Ok(found);
        }

        if search_path && let Ok(found) = which::which(name) {
            debug!(path = %found.display(), "found executable in PATH");
            return Ok(found);
        }
    }

    let tried: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    Err(Error::ExecutableNotFound(tried.join(", ")))
}

/// Resolve the executable a config points at
pub(crate) fn resolve(config: &TaskConfig) -> Result<PathBuf> {
    match &config.gpg_path {
        Some(path) if path.is_file() => Ok(path.clone()),
        Some(path) => Err(Error::ExecutableNotFound(path.display().to_string())),
        None => find_executable(&config.executable_names, &config.search_paths, config.search_path),
    }
}
