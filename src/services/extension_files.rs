//! File access inside an extension's install directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::types::errors::RuntimeError;

/// Resolves `relative` under `base`, refusing anything that escapes it.
///
/// Both paths are canonicalized, so symlinks pointing outside the extension
/// directory are rejected as well as `..` segments.
pub fn resolve_extension_file(base: &Path, relative: &str, extension_id: &str) -> Result<PathBuf, RuntimeError> {
    let missing = || RuntimeError::MissingFile {
        extension_id: extension_id.to_string(),
        path: relative.to_string(),
    };
    let base = base.canonicalize().map_err(|_| missing())?;
    let full = base
        .join(relative.trim_start_matches('/'))
        .canonicalize()
        .map_err(|_| missing())?;
    if !full.starts_with(&base) {
        return Err(RuntimeError::Io(format!(
            "Path traversal blocked: {} escapes extension directory",
            relative
        )));
    }
    if !full.is_file() {
        return Err(missing());
    }
    Ok(full)
}

/// Reads a UTF-8 file from the extension directory.
pub fn read_extension_file(base: &Path, relative: &str, extension_id: &str) -> Result<String, RuntimeError> {
    let full = resolve_extension_file(base, relative, extension_id)?;
    fs::read_to_string(&full).map_err(|e| RuntimeError::Io(format!("Cannot read {}: {}", relative, e)))
}

/// Recursively copies `from` into `to`, creating `to`. Symlinks are skipped.
pub fn copy_dir_all(from: &Path, to: &Path) -> std::io::Result<u64> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let target = to.join(entry.file_name());
        if kind.is_dir() {
            copied += copy_dir_all(&entry.path(), &target)?;
        } else if kind.is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// Deletes a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
