use std::path::{Component, Path};

use crate::TransferError;

/// Validates that `name` is a single plain filename.
///
/// Rejects:
/// - Empty names
/// - `.` and `..`
/// - Anything containing a path separator
/// - Absolute paths and Windows prefix components (`C:`, `\\server`)
pub fn validate_local_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty filename".into()));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidPath(format!(
            "separator not allowed in filename: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir | Component::CurDir), _) => Err(TransferError::InvalidPath(
            format!("relative directory not allowed: {name}"),
        )),
        (Some(Component::Prefix(_) | Component::RootDir), _) => Err(TransferError::InvalidPath(
            format!("absolute path not allowed: {name}"),
        )),
        _ => Err(TransferError::InvalidPath(format!(
            "not a single filename: {name}"
        ))),
    }
}
