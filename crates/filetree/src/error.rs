//! Error types for file tree traversal and copy operations.

use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = FileTreeError> = std::result::Result<T, E>;

/// Main error type for traversal and copy operations.
#[derive(Debug, Error)]
pub enum FileTreeError {
    /// The archive file does not exist.
    #[error("Cannot expand {0} as it does not exist.")]
    NotFound(String),

    /// The archive path exists but is not a regular file.
    #[error("Cannot expand {0} as it is not a file.")]
    NotAFile(String),

    /// A directory tree root does not exist or is not a directory.
    #[error("Directory '{0}' does not exist.")]
    MissingDirectory(PathBuf),

    /// An entry resolves outside of the extraction or destination root.
    #[error("Security violation")]
    Security(#[from] SecurityError),

    /// Traversal of an archive failed; the whole visit was aborted.
    #[error("Cannot expand {archive}.")]
    Expansion {
        /// Display name of the archive
        archive: String,
        #[source]
        source: Box<FileTreeError>,
    },

    /// Copying one element to its destination failed.
    #[error("Could not copy {name} to '{target}'.")]
    Transfer {
        /// Name of the source element
        name: String,
        /// Destination path
        target: PathBuf,
        #[source]
        source: Box<FileTreeError>,
    },

    /// A symbolic link target was requested from an element that is not a link.
    #[error("Not a symbolic link: {0}.")]
    NotASymlink(String),

    /// Raw file access was requested while content filters are registered.
    #[error("Cannot access the file of {0} directly as content filters are registered.")]
    FilteredContent(String),

    /// The element reports a negative modification time.
    #[error("Invalid Timestamp {timestamp} for '{name}'.")]
    InvalidTimestamp {
        /// The offending timestamp in milliseconds
        timestamp: i64,
        /// Name of the element
        name: String,
    },

    /// Two elements mapped to the same destination under the `fail` strategy.
    #[error("Encountered duplicate path \"{0}\" during copy operation configured with duplicates strategy 'fail'.")]
    Duplicate(String),

    /// A content filter could not be applied.
    #[error("Could not filter content: {0}")]
    Filter(String),

    /// The archive container is malformed.
    #[error("Corrupted archive")]
    Corrupted(#[from] zip::result::ZipError),

    /// An I/O error occurred.
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

/// Security-related errors raised by entry path sanitization.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Path traversal attempt detected (e.g., "../../../etc/passwd").
    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    /// Absolute or drive-qualified path not allowed in archive entries.
    #[error("Absolute path not allowed: {0}")]
    AbsolutePath(String),

    /// The entry name normalizes to nothing.
    #[error("Empty entry name: {0:?}")]
    EmptyPath(String),

    /// A materialized path would land outside its root.
    #[error("'{path}' escapes root '{root}'")]
    OutsideRoot {
        /// Candidate path
        path: PathBuf,
        /// Root the path must stay within
        root: PathBuf,
    },

    /// An entry name that is not valid UTF-8, shown with replacement characters.
    #[error("Entry name is not valid UTF-8: {0:?}")]
    NonUtf8Name(String),

    /// A directory between the root and a destination is a symbolic link.
    #[error("'{0}' is reached through a symbolic link")]
    LinkedAncestor(PathBuf),
}

/// Coarse classification of [`FileTreeError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Source missing or not a file. Fatal, never retried.
    Input,
    /// An entry resolves outside its root.
    PathSafety,
    /// Malformed archive or read failure during traversal.
    Expansion,
    /// I/O failure while copying one element.
    Transfer,
    /// Contract violation by the caller.
    InvalidState,
    /// Duplicate destination under the `fail` strategy.
    Duplicate,
    /// Leaf causes (I/O, filters, container format).
    Other,
}

impl FileTreeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::NotAFile(_) | Self::MissingDirectory(_) => ErrorKind::Input,
            Self::Security(_) => ErrorKind::PathSafety,
            Self::Expansion { .. } => ErrorKind::Expansion,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::NotASymlink(_) | Self::FilteredContent(_) | Self::InvalidTimestamp { .. } => {
                ErrorKind::InvalidState
            }
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Filter(_) | Self::Corrupted(_) | Self::Io(_) => ErrorKind::Other,
        }
    }

    /// The innermost `FileTreeError` in a chain of wrapping variants.
    pub fn root_cause(&self) -> &FileTreeError {
        match self {
            Self::Expansion { source, .. } | Self::Transfer { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub(crate) fn expansion(archive: impl Into<String>, source: FileTreeError) -> Self {
        Self::Expansion {
            archive: archive.into(),
            source: Box::new(source),
        }
    }
}

/// Render an error and its whole causal chain as a single line.
pub fn report(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut cause = error.source();
    while let Some(inner) = cause {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        cause = inner.source();
    }
    message
}
