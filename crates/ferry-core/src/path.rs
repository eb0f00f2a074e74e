//! Path validation and conversion
//!
//! Manifest paths travel as forward-slash relative paths. Everything
//! the remote sends is validated here before a single byte touches
//! the disk: no `..`, no absolute roots, no NUL bytes, and the joined
//! result must stay under its base directory.

use std::path::{Component, Path, PathBuf};

use crate::error::TransferError;

/// Maximum wire path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum single component length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Validate a wire path and join it under `base`.
///
/// Builds the result component by component without touching the
/// filesystem, so it works for paths that do not exist yet. `.`
/// components are dropped; `..`, absolute roots, prefixes, and NUL
/// bytes are rejected.
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, TransferError> {
    if relative.is_empty() {
        return Err(TransferError::Path("empty path".into()));
    }
    if relative.contains('\0') {
        return Err(TransferError::Path(format!("path contains NUL: {relative:?}")));
    }
    if relative.len() > MAX_PATH_LEN {
        return Err(TransferError::Path(format!(
            "path too long: {} bytes (max {MAX_PATH_LEN})",
            relative.len()
        )));
    }

    let mut result = base.to_path_buf();
    let mut pushed = false;

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                if name.to_string_lossy().len() > MAX_FILENAME_LEN {
                    return Err(TransferError::Path(format!(
                        "component too long in {relative}"
                    )));
                }
                result.push(name);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::Path(format!(
                    "parent directory not allowed: {relative}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::Path(format!(
                    "absolute path not allowed: {relative}"
                )));
            }
        }
    }

    if !pushed {
        return Err(TransferError::Path(format!("path has no components: {relative}")));
    }

    // Belt and braces: the component walk above cannot escape, but a
    // future edit might.
    if !result.starts_with(base) {
        return Err(TransferError::Path(format!("path escapes base: {relative}")));
    }

    Ok(result)
}

/// Convert a native relative path to its wire form (forward slashes).
pub fn to_wire(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}
