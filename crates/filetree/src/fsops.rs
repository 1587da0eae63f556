//! Small filesystem primitives used when materializing elements.

use crate::error::{FileTreeError, Result};
use crate::types::FilePermissions;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Create the parent directories of `path`.
pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write `path` through a temporary sibling that replaces it once complete.
pub(crate) fn write_atomically(
    path: &Path,
    write: &mut dyn FnMut(&mut dyn Write) -> Result<u64>,
) -> Result<u64> {
    let parent = path.parent().ok_or_else(|| {
        FileTreeError::Io(std::io::Error::other(format!(
            "'{}' has no parent directory",
            path.display()
        )))
    })?;

    let temp = tempfile::Builder::new()
        .prefix(".filetree-")
        .suffix(".tmp")
        .tempfile_in(parent)?;

    let written = {
        let mut writer = BufWriter::new(temp.as_file());
        let written = write(&mut writer)?;
        writer.flush()?;
        written
    };

    temp.persist(path).map_err(|e| FileTreeError::Io(e.error))?;
    Ok(written)
}

/// Apply permission bits to an existing path.
#[cfg(unix)]
pub(crate) fn apply_permissions(path: &Path, permissions: FilePermissions) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(permissions.mode()))?;
    Ok(())
}

/// Apply permission bits to an existing path. Only the write bits are meaningful here.
#[cfg(not(unix))]
pub(crate) fn apply_permissions(path: &Path, permissions: FilePermissions) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(permissions.mode() & 0o222 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Replace whatever is at `link` with a symbolic link to the literal `target`.
///
/// The link is created under a temporary name and renamed over `link`, so readers
/// never observe a missing path.
#[cfg(unix)]
pub(crate) fn replace_with_symlink(target: &str, link: &Path) -> Result<()> {
    let parent = link.parent().unwrap_or_else(|| Path::new("."));
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{}.{}.link", name, std::process::id()));

    if fs::symlink_metadata(&staging).is_ok() {
        fs::remove_file(&staging)?;
    }
    std::os::unix::fs::symlink(target, &staging)?;

    if let Ok(existing) = fs::symlink_metadata(link) {
        if existing.is_dir() {
            fs::remove_dir_all(link)?;
        }
    }

    fs::rename(&staging, link).map_err(|e| {
        let _ = fs::remove_file(&staging);
        FileTreeError::Io(e)
    })
}

/// Without symbolic link support the literal target is written as file content.
#[cfg(not(unix))]
pub(crate) fn replace_with_symlink(target: &str, link: &Path) -> Result<()> {
    let bytes = target.as_bytes();
    write_atomically(link, &mut |w| {
        w.write_all(bytes)?;
        Ok(bytes.len() as u64)
    })?;
    Ok(())
}
