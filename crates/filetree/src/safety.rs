//! Security checks for archive entry names.
//!
//! Every raw entry name read from an archive is untrusted. This module turns such
//! names into [`RelativePath`]s and rejects anything that could escape the root it is
//! materialized under (the zip-slip vulnerability class). Unsafe names are refused,
//! never rewritten into some other path.

use crate::error::SecurityError;
use crate::types::RelativePath;
use std::path::{Component, Path};

/// Validates an archive entry name and converts it into a [`RelativePath`].
///
/// This function performs the following checks:
/// - Rejects names starting with a separator
/// - Rejects drive-qualified names such as `C:/x` or `C:x`
/// - Rejects names containing a `..` segment (path traversal)
/// - Collapses redundant separators and `.` segments
///
/// # Examples
///
/// ```
/// use filetree::safety::sanitize_entry_name;
///
/// let path = sanitize_entry_name("dir//./file.txt", false).unwrap();
/// assert_eq!(path.path_string(), "dir/file.txt");
///
/// assert!(sanitize_entry_name("../../etc/passwd", false).is_err());
/// assert!(sanitize_entry_name("/etc/passwd", false).is_err());
/// ```
pub fn sanitize_entry_name(raw: &str, is_directory: bool) -> Result<RelativePath, SecurityError> {
    let segments = sanitize_segments(raw)?;
    Ok(RelativePath::from_segments(!is_directory, segments))
}

/// Splits a raw name into safe segments. Both `/` and `\` count as separators.
pub(crate) fn sanitize_segments(raw: &str) -> Result<Vec<String>, SecurityError> {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(SecurityError::AbsolutePath(raw.to_string()));
    }

    let mut segments = Vec::new();
    for (index, part) in raw.split(['/', '\\']).enumerate() {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(SecurityError::PathTraversal(format!(
                    "Path contains '..' component: {}",
                    raw
                )));
            }
            _ if index == 0 && is_drive_prefix(part) => {
                return Err(SecurityError::AbsolutePath(raw.to_string()));
            }
            _ if part.contains('\0') => {
                return Err(SecurityError::PathTraversal(format!(
                    "Path contains a NUL byte: {:?}",
                    raw
                )));
            }
            _ => segments.push(part.to_string()),
        }
    }

    if segments.is_empty() {
        return Err(SecurityError::EmptyPath(raw.to_string()));
    }

    Ok(segments)
}

fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Checks that `candidate` is a strict descendant of `root`.
///
/// Both paths are compared lexically; `candidate` must be `root` joined with one or
/// more normal components.
pub fn ensure_within(root: &Path, candidate: &Path) -> Result<(), SecurityError> {
    let outside = || SecurityError::OutsideRoot {
        path: candidate.to_path_buf(),
        root: root.to_path_buf(),
    };

    let relative = candidate.strip_prefix(root).map_err(|_| outside())?;
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            _ => return Err(outside()),
        }
    }

    if depth == 0 {
        return Err(outside());
    }
    Ok(())
}

/// Checks that no existing directory between `root` and `candidate` is a symbolic
/// link, so writing `candidate` cannot land outside `root` through a link created
/// earlier in the same copy.
pub fn ensure_no_linked_ancestors(root: &Path, candidate: &Path) -> Result<(), SecurityError> {
    let mut current = candidate.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if let Ok(metadata) = std::fs::symlink_metadata(dir) {
            if metadata.file_type().is_symlink() {
                return Err(SecurityError::LinkedAncestor(dir.to_path_buf()));
            }
        }
        current = dir.parent();
    }
    Ok(())
}
