//! # Filetree
//!
//! Archive-backed virtual file trees and a filtered copy pipeline.
//!
//! An archive is exposed as a tree of elements visited in a reproducible, sorted
//! order. Entry names are sanitized before use so that nothing resolves outside the
//! cache or destination root. Entries are only decompressed to disk when a caller
//! asks for a file, into a cache directory named after the archive's content hash.
//!
//! Every element, whether it comes from a directory or an archive, can be copied
//! through a [`CopySpec`] that decides its destination, permissions, link handling,
//! duplicate handling and content filters.
//!
//! ## Supported Formats
//!
//! - ZIP (including JAR, WAR, EAR and AAR)
//! - TAR (plain, gzip or bzip2 compressed)
//!
//! ## Example
//!
//! ```rust,no_run
//! use filetree::{
//!     copy_tree, ArchiveTree, CopySpec, DirectoryDecompressionCache, FilePermissions,
//!     LinksStrategy, Sha256Hasher,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(DirectoryDecompressionCache::new("/tmp/filetree-cache")?);
//! let tree = ArchiveTree::open("bundle.zip", cache, Arc::new(Sha256Hasher))?;
//!
//! let spec = CopySpec::new()
//!     .destination("lib")?
//!     .file_mode(FilePermissions::new(0o644))
//!     .preserve_links(LinksStrategy::relative());
//!
//! let report = copy_tree(&tree, &spec, Path::new("build"))?;
//! println!("Copied {} elements, {} failed", report.copied(), report.failed());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod copy;
pub mod details;
pub mod element;
pub mod error;
pub mod filter;
mod fsops;
pub mod safety;
pub mod spec;
pub mod tree;
pub mod types;

// Re-export main types
pub use archive::{ArchiveElement, ArchiveEntryRecord, ArchiveFormat, ArchiveTree, TarCompression};
pub use cache::{ContentHasher, DecompressionCache, DirectoryDecompressionCache, Sha256Hasher};
pub use copy::{copy_tree, CopyBatch};
pub use details::FileCopyDetails;
pub use element::{FileSystemElement, FileTreeElement};
pub use error::{ErrorKind, FileTreeError, Result, SecurityError};
pub use filter::{ByteCountingSink, FilterChain};
pub use spec::{CopyAction, CopySpec, CopySpecResolver};
pub use tree::{DirectoryTree, FileTree, FileVisitor};
pub use types::{
    Charset, CopyOutcome, CopyReport, CopyResult, DuplicatesStrategy, EntryKind,
    FilePermissions, LinksStrategy, RelativePath,
};
