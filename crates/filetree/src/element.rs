//! The uniform per-entry view shared by filesystem and archive trees.

use crate::error::{FileTreeError, Result};
use crate::types::{EntryKind, FilePermissions, RelativePath};
use std::fs::{self, File, Metadata};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One entry of a file tree, whatever its backing store.
///
/// Elements handed to a [`FileVisitor`](crate::FileVisitor) are only valid for the
/// duration of the callback.
pub trait FileTreeElement {
    /// Human readable description, e.g. `zip entry /a.zip!dir/file.txt`.
    fn display_name(&self) -> String;

    /// Sanitized path of this element relative to its tree root.
    fn relative_path(&self) -> &RelativePath;

    /// Last segment of the relative path.
    fn name(&self) -> &str {
        self.relative_path().last_name()
    }

    /// The relative path joined with `/`.
    fn path(&self) -> String {
        self.relative_path().path_string()
    }

    fn is_directory(&self) -> bool;

    /// Whether this element is exposed as a symbolic link. Links flattened by the
    /// active links strategy report `false`.
    fn is_symlink(&self) -> bool;

    /// Literal link target. Fails with [`FileTreeError::NotASymlink`] for anything
    /// that is not exposed as a link.
    fn symlink_target(&self) -> Result<String>;

    /// Stream the content into `sink`, returning the number of bytes written.
    fn copy_to(&self, sink: &mut dyn Write) -> Result<u64>;

    /// Open the content for reading.
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        let mut buffer = Vec::new();
        self.copy_to(&mut buffer)?;
        Ok(Box::new(Cursor::new(buffer)))
    }

    /// A path on disk holding this element's content, materializing it if needed.
    fn file(&self) -> Result<PathBuf>;

    /// Permissions of the source, never zero.
    fn permissions(&self) -> FilePermissions;

    /// Modification time in milliseconds since the Unix epoch. Not validated here.
    fn last_modified(&self) -> i64;

    /// Source-reported size in bytes.
    fn size(&self) -> u64;

    /// Ask the driving traversal not to dispatch any further entries.
    fn stop_visiting(&self);

    fn kind(&self) -> EntryKind {
        if self.is_symlink() {
            EntryKind::Symlink
        } else if self.is_directory() {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// An element backed by a path on the local filesystem.
#[derive(Debug)]
pub struct FileSystemElement {
    path: PathBuf,
    relative_path: RelativePath,
    preserve_link: bool,
    stop_flag: Arc<AtomicBool>,
}

impl FileSystemElement {
    pub fn new(
        path: PathBuf,
        relative_path: RelativePath,
        preserve_link: bool,
        stop_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            path,
            relative_path,
            preserve_link,
            stop_flag,
        }
    }

    /// A standalone element for a single path, named by its final component.
    pub fn of(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                FileTreeError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' has no file name", path.display()),
                ))
            })?;
        let relative_path = RelativePath::parse(!metadata.is_dir(), &name)?;
        Ok(Self::new(
            path,
            relative_path,
            false,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    /// The backing path.
    pub fn source_path(&self) -> &Path {
        &self.path
    }

    fn metadata(&self) -> io::Result<Metadata> {
        if self.preserve_link {
            fs::symlink_metadata(&self.path)
        } else {
            fs::metadata(&self.path)
        }
    }
}

impl FileTreeElement for FileSystemElement {
    fn display_name(&self) -> String {
        format!("file '{}'", self.path.display())
    }

    fn relative_path(&self) -> &RelativePath {
        &self.relative_path
    }

    fn is_directory(&self) -> bool {
        !self.relative_path.is_file()
    }

    fn is_symlink(&self) -> bool {
        self.preserve_link
    }

    fn symlink_target(&self) -> Result<String> {
        if !self.preserve_link {
            return Err(FileTreeError::NotASymlink(self.display_name()));
        }
        let target = fs::read_link(&self.path)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn copy_to(&self, sink: &mut dyn Write) -> Result<u64> {
        let mut file = File::open(&self.path)?;
        Ok(io::copy(&mut file, sink)?)
    }

    fn open(&self) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn file(&self) -> Result<PathBuf> {
        Ok(self.path.clone())
    }

    fn permissions(&self) -> FilePermissions {
        match self.metadata() {
            Ok(metadata) => permissions_of(&metadata, self.is_directory()),
            Err(_) => FilePermissions::default_for(self.is_directory()),
        }
    }

    fn last_modified(&self) -> i64 {
        self.metadata()
            .and_then(|m| m.modified())
            .map(millis_since_epoch)
            .unwrap_or(0)
    }

    fn size(&self) -> u64 {
        self.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn stop_visiting(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(unix)]
fn permissions_of(metadata: &Metadata, _is_directory: bool) -> FilePermissions {
    use std::os::unix::fs::PermissionsExt;
    FilePermissions::new(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn permissions_of(metadata: &Metadata, is_directory: bool) -> FilePermissions {
    let default = FilePermissions::default_for(is_directory);
    if metadata.permissions().readonly() {
        FilePermissions::new(default.mode() & 0o555)
    } else {
        default
    }
}

pub(crate) fn millis_since_epoch(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}
