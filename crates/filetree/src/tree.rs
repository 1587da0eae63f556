//! File tree traversal contracts and the plain directory tree.

use crate::element::{FileSystemElement, FileTreeElement};
use crate::error::{FileTreeError, Result};
use crate::types::{LinksStrategy, RelativePath};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// Callback driven by [`FileTree::visit`].
pub trait FileVisitor {
    /// Called for every directory element.
    fn visit_dir(&mut self, element: &dyn FileTreeElement) -> Result<()>;

    /// Called for every file or symbolic link element.
    fn visit_file(&mut self, element: &dyn FileTreeElement) -> Result<()>;

    /// Links policy the tree applies while typing elements.
    fn links_strategy(&self) -> LinksStrategy {
        LinksStrategy::None
    }
}

/// A tree of elements that can be visited in a reproducible order.
pub trait FileTree {
    fn display_name(&self) -> String;

    /// Visit every element. A visitor may stop the traversal early through
    /// [`FileTreeElement::stop_visiting`]; the current element always completes.
    fn visit(&self, visitor: &mut dyn FileVisitor) -> Result<()>;
}

/// A tree rooted at a directory on the local filesystem.
///
/// Siblings are visited in file name order, parents before their children.
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    root: PathBuf,
}

impl DirectoryTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(&self, visitor: &mut dyn FileVisitor) -> Result<()> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let links = visitor.links_strategy();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            if stop_flag.load(Ordering::Relaxed) {
                debug!(tree = %self.display_name(), "Traversal stopped by visitor");
                break;
            }

            let entry = entry.map_err(|e| FileTreeError::Io(e.into()))?;
            let path = entry.path();

            let (preserve_link, is_directory) = if entry.path_is_symlink() {
                let target = fs::read_link(path)?;
                if links.should_be_preserved(&target.to_string_lossy()) {
                    (true, false)
                } else {
                    (false, fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false))
                }
            } else {
                (false, entry.file_type().is_dir())
            };

            let segments = path
                .strip_prefix(&self.root)
                .map_err(|_| {
                    FileTreeError::Security(crate::error::SecurityError::OutsideRoot {
                        path: path.to_path_buf(),
                        root: self.root.clone(),
                    })
                })?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();

            let element = FileSystemElement::new(
                path.to_path_buf(),
                RelativePath::from_segments(!is_directory, segments),
                preserve_link,
                stop_flag.clone(),
            );

            if is_directory {
                visitor.visit_dir(&element)?;
            } else {
                visitor.visit_file(&element)?;
            }
        }

        Ok(())
    }
}

impl FileTree for DirectoryTree {
    fn display_name(&self) -> String {
        format!("directory '{}'", self.root.display())
    }

    fn visit(&self, visitor: &mut dyn FileVisitor) -> Result<()> {
        if !self.root.is_dir() {
            return Err(FileTreeError::MissingDirectory(self.root.clone()));
        }
        self.walk(visitor)
            .map_err(|e| FileTreeError::expansion(self.display_name(), e))
    }
}
