use std::path::{Component, Path};

use crate::TransferError;

/// Longest object name a destination may carry, in bytes.
pub const MAX_OBJECT_NAME_LEN: usize = 1024;

/// Validates an object name inside a destination container.
///
/// Rejects:
/// - Empty names and names longer than [`MAX_OBJECT_NAME_LEN`]
/// - NUL bytes
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - Parent directory traversal (`..`)
pub fn validate_object_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty object name".into()));
    }
    if name.len() > MAX_OBJECT_NAME_LEN {
        return Err(TransferError::InvalidPath(format!(
            "object name longer than {MAX_OBJECT_NAME_LEN} bytes"
        )));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidPath(
            "object name contains a NUL byte".into(),
        ));
    }

    let path = Path::new(name);
    if path.is_absolute() || name.starts_with('/') || name.starts_with('\\') {
        return Err(TransferError::InvalidPath(format!(
            "absolute object name not allowed: {name}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute object name not allowed: {name}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    // `..` hidden behind backslashes is not a component on Unix.
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(TransferError::InvalidPath(format!(
            "parent directory traversal not allowed: {name}"
        )));
    }

    Ok(())
}
