//! Type definitions shared by trees, elements and copy operations.

use crate::error::{FileTreeError, SecurityError};
use crate::safety;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A sanitized path relative to some root, plus whether it names a file.
///
/// Segments never contain `..`, `.`, separators or drive prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativePath {
    segments: Vec<String>,
    is_file: bool,
}

impl RelativePath {
    /// The empty path, used as the destination prefix of a root spec.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            is_file: false,
        }
    }

    /// Parse a `/`-separated path, rejecting anything that could escape a root.
    pub fn parse(is_file: bool, path: &str) -> Result<Self, SecurityError> {
        let segments = safety::sanitize_segments(path)?;
        Ok(Self { segments, is_file })
    }

    pub(crate) fn from_segments(is_file: bool, segments: Vec<String>) -> Self {
        Self { segments, is_file }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_file(&self) -> bool {
        self.is_file
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, or the empty string for the root path.
    pub fn last_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// The path joined with `/`.
    pub fn path_string(&self) -> String {
        self.segments.join("/")
    }

    /// Parent path, always a directory. `None` for the root path.
    pub fn parent(&self) -> Option<RelativePath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
            is_file: false,
        })
    }

    /// Append `other` below this path; the result takes `other`'s file flag.
    pub fn append(&self, other: &RelativePath) -> RelativePath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self {
            segments,
            is_file: other.is_file,
        }
    }

    /// Replace the last segment. The name must be a single safe segment.
    pub fn replace_last_name(&self, name: &str) -> Result<RelativePath, SecurityError> {
        let replacement = safety::sanitize_segments(name)?;
        if replacement.len() != 1 {
            return Err(SecurityError::PathTraversal(format!(
                "'{}' is not a single path segment",
                name
            )));
        }
        let mut segments = self.segments.clone();
        segments.pop();
        segments.extend(replacement);
        Ok(Self {
            segments,
            is_file: self.is_file,
        })
    }

    /// The on-disk location of this path under `root`.
    pub fn resolve_under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in &self.segments {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path_string())
    }
}

/// Unix permission bits of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilePermissions(u32);

impl FilePermissions {
    /// Default permissions for files (`rw-r--r--`).
    pub const DEFAULT_FILE: FilePermissions = FilePermissions(0o644);
    /// Default permissions for directories (`rwxr-xr-x`).
    pub const DEFAULT_DIRECTORY: FilePermissions = FilePermissions(0o755);

    pub fn new(mode: u32) -> Self {
        Self(mode & 0o777)
    }

    pub fn default_for(is_directory: bool) -> Self {
        if is_directory {
            Self::DEFAULT_DIRECTORY
        } else {
            Self::DEFAULT_FILE
        }
    }

    /// Permissions recorded by an archive entry. A zero mode means the archive did
    /// not record any bits, so the generic default for the kind applies.
    pub fn from_archive_mode(mode: u32, is_directory: bool) -> Self {
        match mode & 0o777 {
            0 => Self::default_for(is_directory),
            bits => Self(bits),
        }
    }

    pub fn mode(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FilePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl FromStr for FilePermissions {
    type Err = String;

    /// Parses octal notation such as `755` or `0o644`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("0o");
        u32::from_str_radix(digits, 8)
            .map(Self::new)
            .map_err(|_| format!("'{}' is not an octal permission mode", s))
    }
}

/// Kind of an entry in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// How to handle two elements mapped to the same destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatesStrategy {
    /// Copy every element, later ones overwrite earlier ones
    Include,
    /// Keep the first element, skip later ones
    Exclude,
    /// Like `Include`, but log a warning
    Warn,
    /// Fail the element that collides
    Fail,
    /// Use the strategy of the enclosing specification
    #[default]
    Inherit,
}

impl FromStr for DuplicatesStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            "warn" => Ok(Self::Warn),
            "fail" => Ok(Self::Fail),
            "inherit" => Ok(Self::Inherit),
            other => Err(format!("unknown duplicates strategy '{}'", other)),
        }
    }
}

/// Decides whether symbolic links are kept as links or flattened into files.
#[derive(Clone, Default)]
pub enum LinksStrategy {
    /// Flatten every link
    #[default]
    None,
    /// Preserve every link
    All,
    /// Preserve a link when the predicate accepts its target
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl LinksStrategy {
    pub fn predicate(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    /// Preserve only relative targets that never step above their own directory tree.
    pub fn relative() -> Self {
        Self::predicate(|target| {
            !target.starts_with('/')
                && !target.starts_with('\\')
                && !target.split(['/', '\\']).any(|segment| segment == "..")
        })
    }

    pub fn should_be_preserved(&self, target: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Predicate(predicate) => predicate(target),
        }
    }

    /// Whether deciding requires the link target to be read first.
    pub fn needs_target(&self) -> bool {
        matches!(self, Self::Predicate(_))
    }
}

impl fmt::Debug for LinksStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::All => f.write_str("All"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl FromStr for LinksStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "relative" => Ok(Self::relative()),
            other => Err(format!("unknown links strategy '{}'", other)),
        }
    }
}

/// Character set used to decode content before filters run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "iso-8859-1")]
    Latin1,
}

impl Charset {
    pub fn decode(self, bytes: &[u8]) -> Result<String, FileTreeError> {
        match self {
            Self::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| FileTreeError::Filter(format!("content is not valid UTF-8: {}", e))),
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, FileTreeError> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        FileTreeError::Filter(format!("'{}' cannot be encoded as ISO-8859-1", c))
                    })
                })
                .collect(),
        }
    }
}

impl FromStr for Charset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            other => Err(format!("unsupported charset '{}'", other)),
        }
    }
}

/// Result of copying one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CopyResult {
    Copied,
    SkippedDuplicate,
    Excluded,
    Failed { message: String },
}

/// Outcome of one element of a copy batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyOutcome {
    /// Source path relative to its tree
    pub source: String,
    /// Materialized destination path
    pub target: PathBuf,
    /// Applied permission bits, if any were applied
    pub mode: Option<FilePermissions>,
    pub result: CopyResult,
}

/// Statistics about a completed copy batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyReport {
    pub outcomes: Vec<CopyOutcome>,

    /// Duration of the copy operation (in seconds)
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl CopyReport {
    pub fn copied(&self) -> usize {
        self.count(|r| matches!(r, CopyResult::Copied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| matches!(r, CopyResult::SkippedDuplicate))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, CopyResult::Failed { .. }))
    }

    /// Whether any destination was written.
    pub fn did_work(&self) -> bool {
        self.copied() > 0
    }

    fn count(&self, predicate: impl Fn(&CopyResult) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.result)).count()
    }
}

// Helper module for Duration serialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
