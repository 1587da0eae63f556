//! Archive-backed file trees.
//!
//! An [`ArchiveTree`] exposes the entries of a ZIP or TAR archive as a sorted sequence
//! of [`FileTreeElement`]s. Entries are always visited in ascending order of their raw
//! names, whatever order the container stores them in, so repeated visits of the same
//! content produce identical output.
//!
//! Every entry name is sanitized before the visitor sees it; an unsafe name aborts the
//! traversal. Symbolic link entries are typed according to the visitor's
//! [`LinksStrategy`]: preserved links expose their target, flattened links look like
//! regular files whose content is the literal target.

use crate::cache::{self, ContentHasher, DecompressionCache};
use crate::element::FileTreeElement;
use crate::error::{ErrorKind, FileTreeError, Result, SecurityError};
use crate::fsops;
use crate::safety::{ensure_no_linked_ancestors, ensure_within, sanitize_entry_name};
use crate::tree::{DirectoryTree, FileTree, FileVisitor};
use crate::types::{EntryKind, FilePermissions, LinksStrategy, RelativePath};
use std::cell::{OnceCell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Compression applied around a TAR stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
}

/// Container format of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar(TarCompression),
}

impl ArchiveFormat {
    /// Detect the format from the file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let filename = path.file_name()?.to_str()?.to_lowercase();

        if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
            Some(Self::Tar(TarCompression::Gzip))
        } else if filename.ends_with(".tar.bz2") || filename.ends_with(".tbz2") {
            Some(Self::Tar(TarCompression::Bzip2))
        } else if filename.ends_with(".tar") {
            Some(Self::Tar(TarCompression::None))
        } else if [".zip", ".jar", ".war", ".ear", ".aar"]
            .iter()
            .any(|ext| filename.ends_with(ext))
        {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Literal prefix of expanded cache directory names.
    pub fn cache_prefix(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar(_) => "tar",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Zip => "ZIP",
            Self::Tar(_) => "TAR",
        }
    }
}

/// Where the bytes of an entry come from.
#[derive(Debug)]
enum EntryData {
    /// Index into the ZIP central directory, decompressed on demand
    ZipIndex(usize),
    /// Position in the TAR stream, re-read on demand
    TarPosition(usize),
    /// Link target recorded in a TAR header
    LinkTarget(Vec<u8>),
}

/// One raw entry of an archive, exactly as the container describes it.
#[derive(Debug)]
pub struct ArchiveEntryRecord {
    name: String,
    kind: EntryKind,
    unix_mode: u32,
    size: u64,
    last_modified: i64,
    data: EntryData,
}

impl ArchiveEntryRecord {
    /// Untrusted raw entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn unix_mode(&self) -> u32 {
        self.unix_mode
    }
}

/// Entries keyed and iterated by raw name. A later entry with the same name wins.
type SortedEntryIndex = BTreeMap<String, ArchiveEntryRecord>;

/// An open archive container.
enum ArchiveReader {
    Zip(zip::ZipArchive<BufReader<File>>),
    /// TAR streams cannot seek, so each content request decodes the stream again.
    Tar {
        path: PathBuf,
        compression: TarCompression,
    },
}

impl ArchiveReader {
    fn open(path: &Path, format: ArchiveFormat) -> Result<(Self, SortedEntryIndex)> {
        match format {
            ArchiveFormat::Zip => {
                let mut archive = zip::ZipArchive::new(BufReader::new(File::open(path)?))?;
                let index = index_zip(&mut archive, path)?;
                Ok((Self::Zip(archive), index))
            }
            ArchiveFormat::Tar(compression) => {
                let index = index_tar(open_tar(path, compression)?)?;
                let reader = Self::Tar {
                    path: path.to_path_buf(),
                    compression,
                };
                Ok((reader, index))
            }
        }
    }

    fn copy_entry(&mut self, record: &ArchiveEntryRecord, sink: &mut dyn Write) -> Result<u64> {
        match (&record.data, self) {
            (EntryData::LinkTarget(bytes), _) => {
                sink.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            (EntryData::ZipIndex(index), Self::Zip(archive)) => {
                let mut file = archive.by_index(*index)?;
                Ok(io::copy(&mut file, sink)?)
            }
            (EntryData::TarPosition(position), Self::Tar { path, compression }) => {
                let mut archive = open_tar(path, *compression)?;
                let entry = archive.entries()?.nth(*position).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("entry '{}' is missing from the stream", record.name),
                    )
                })?;
                let copied = io::copy(&mut entry?, sink)?;
                Ok(copied)
            }
            _ => Err(FileTreeError::Io(io::Error::other(format!(
                "no container open for entry '{}'",
                record.name
            )))),
        }
    }
}

fn open_tar(path: &Path, compression: TarCompression) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match compression {
        TarCompression::None => Box::new(file),
        TarCompression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        TarCompression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
    };
    Ok(tar::Archive::new(reader))
}

/// Host system of a central directory record created on Unix.
const HOST_UNIX: u8 = 3;

/// Whether the central directory record starting at `offset` was made on a Unix host.
///
/// Modes reported for other hosts are synthesized from DOS attributes and say
/// nothing about the entry's real permissions.
fn made_on_unix(archive_file: &mut File, offset: u64) -> Result<bool> {
    // signature (4 bytes), then version made by: spec version, host system
    let mut host = [0u8; 1];
    archive_file.seek(SeekFrom::Start(offset + 5))?;
    archive_file.read_exact(&mut host)?;
    Ok(host[0] == HOST_UNIX)
}

fn index_zip(
    archive: &mut zip::ZipArchive<BufReader<File>>,
    path: &Path,
) -> Result<SortedEntryIndex> {
    let mut archive_file = File::open(path)?;
    let mut index = SortedEntryIndex::new();
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        let unix_mode = if made_on_unix(&mut archive_file, file.central_header_start())? {
            file.unix_mode().unwrap_or(0)
        } else {
            0
        };
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else if unix_mode & S_IFMT == S_IFLNK {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };

        // MS-DOS timestamps carry no zone; they are read as UTC.
        let last_modified = file
            .last_modified()
            .and_then(|time| time.to_time().ok())
            .map(|time| time.unix_timestamp().saturating_mul(1000))
            .unwrap_or(0);

        let record = ArchiveEntryRecord {
            name: file.name().to_string(),
            kind,
            unix_mode,
            size: file.size(),
            last_modified,
            data: EntryData::ZipIndex(i),
        };
        index.insert(record.name.clone(), record);
    }
    Ok(index)
}

/// Index the headers of a TAR stream. Content is skipped, not read.
fn index_tar<R: Read>(mut archive: tar::Archive<R>) -> Result<SortedEntryIndex> {
    let mut index = SortedEntryIndex::new();
    for (position, entry) in archive.entries()?.enumerate() {
        let entry = entry?;
        let raw_name = entry.path_bytes();
        let name = match std::str::from_utf8(&raw_name) {
            Ok(name) => name.to_string(),
            Err(_) => {
                let lossy = String::from_utf8_lossy(&raw_name).into_owned();
                return Err(SecurityError::NonUtf8Name(lossy).into());
            }
        };
        let header = entry.header();
        let entry_type = header.entry_type();
        let unix_mode = header.mode().unwrap_or(0);
        let last_modified = header
            .mtime()
            .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000))
            .unwrap_or(0);

        let kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() {
            EntryKind::Symlink
        } else if entry_type.is_file() {
            EntryKind::File
        } else {
            debug!(entry = %name, "Skipping unsupported tar entry type {:?}", entry_type);
            continue;
        };

        let (size, data) = if kind == EntryKind::Symlink {
            let target = entry
                .link_name_bytes()
                .map(|target| target.into_owned())
                .unwrap_or_default();
            (target.len() as u64, EntryData::LinkTarget(target))
        } else {
            (entry.size(), EntryData::TarPosition(position))
        };

        let record = ArchiveEntryRecord {
            name,
            kind,
            unix_mode,
            size,
            last_modified,
            data,
        };
        index.insert(record.name.clone(), record);
    }
    Ok(index)
}

/// State shared by every element of one traversal.
struct Traversal<'a> {
    archive_path: &'a Path,
    format: ArchiveFormat,
    reader: RefCell<ArchiveReader>,
    expanded_dir: PathBuf,
    cache_key: String,
    cache: &'a dyn DecompressionCache,
    stop_flag: Arc<AtomicBool>,
}

impl Traversal<'_> {
    fn copy_entry(&self, record: &ArchiveEntryRecord, sink: &mut dyn Write) -> Result<u64> {
        self.reader.borrow_mut().copy_entry(record, sink)
    }

    fn read_link_target(&self, record: &ArchiveEntryRecord) -> Result<String> {
        let mut bytes = Vec::new();
        self.copy_entry(record, &mut bytes)?;
        String::from_utf8(bytes).map_err(|e| {
            FileTreeError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("link target of '{}' is not UTF-8: {}", record.name, e),
            ))
        })
    }
}

/// One archive entry, as handed to a [`FileVisitor`].
pub struct ArchiveElement<'a> {
    traversal: &'a Traversal<'a>,
    record: &'a ArchiveEntryRecord,
    relative_path: RelativePath,
    preserve_link: bool,
    link_target: OnceCell<String>,
}

impl ArchiveElement<'_> {
    /// The raw record backing this element.
    pub fn record(&self) -> &ArchiveEntryRecord {
        self.record
    }

    /// Whether `target` already holds a node of this element's type.
    fn is_materialized(&self, target: &Path) -> bool {
        match fs::symlink_metadata(target) {
            Ok(metadata) => {
                let file_type = metadata.file_type();
                if self.is_directory() {
                    file_type.is_dir()
                } else if self.preserve_link && cfg!(unix) {
                    file_type.is_symlink()
                } else {
                    file_type.is_file()
                }
            }
            Err(_) => false,
        }
    }

    fn materialize(&self, target: &Path) -> Result<()> {
        // Links and files are renamed into place, which replaces any other non-directory.
        match fs::symlink_metadata(target) {
            Ok(existing) if existing.is_dir() && !self.is_directory() => fs::remove_dir_all(target)?,
            Ok(existing) if !existing.is_dir() && self.is_directory() => fs::remove_file(target)?,
            _ => {}
        }

        if self.is_directory() {
            fs::create_dir_all(target)?;
            return fsops::apply_permissions(target, self.permissions());
        }

        fsops::ensure_parent(target)?;
        if self.preserve_link {
            return fsops::replace_with_symlink(&self.symlink_target()?, target);
        }

        fsops::write_atomically(target, &mut |sink| self.copy_to(sink))?;
        fsops::apply_permissions(target, self.permissions())
    }
}

impl FileTreeElement for ArchiveElement<'_> {
    fn display_name(&self) -> String {
        format!(
            "{} entry {}!{}",
            self.traversal.format.label().to_lowercase(),
            self.traversal.archive_path.display(),
            self.record.name
        )
    }

    fn relative_path(&self) -> &RelativePath {
        &self.relative_path
    }

    fn is_directory(&self) -> bool {
        self.record.kind == EntryKind::Directory
    }

    fn is_symlink(&self) -> bool {
        self.preserve_link
    }

    fn symlink_target(&self) -> Result<String> {
        if !self.preserve_link {
            return Err(FileTreeError::NotASymlink(self.display_name()));
        }
        if let Some(target) = self.link_target.get() {
            return Ok(target.clone());
        }
        let target = self.traversal.read_link_target(self.record)?;
        Ok(self.link_target.get_or_init(|| target).clone())
    }

    fn copy_to(&self, sink: &mut dyn Write) -> Result<u64> {
        self.traversal.copy_entry(self.record, sink)
    }

    /// Materializes this entry under the expanded cache directory. A node already
    /// present there is reused without taking the populate lock when its type
    /// matches this element; otherwise it is replaced.
    fn file(&self) -> Result<PathBuf> {
        let expanded_dir = &self.traversal.expanded_dir;
        let target = self.relative_path.resolve_under(expanded_dir);
        ensure_within(expanded_dir, &target)?;
        ensure_no_linked_ancestors(expanded_dir, &target)?;

        if self.is_materialized(&target) {
            return Ok(target);
        }

        self.traversal
            .cache
            .with_populate_lock(&self.traversal.cache_key, &mut || {
                if self.is_materialized(&target) {
                    return Ok(());
                }
                debug!(entry = %self.record.name, target = %target.display(), "Materializing entry");
                self.materialize(&target)
            })?;
        Ok(target)
    }

    fn permissions(&self) -> FilePermissions {
        FilePermissions::from_archive_mode(self.record.unix_mode, self.is_directory())
    }

    fn last_modified(&self) -> i64 {
        self.record.last_modified
    }

    fn size(&self) -> u64 {
        self.record.size
    }

    fn stop_visiting(&self) {
        self.traversal.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// A file tree backed by a ZIP or TAR archive.
pub struct ArchiveTree {
    path: PathBuf,
    format: ArchiveFormat,
    cache: Arc<dyn DecompressionCache>,
    hasher: Arc<dyn ContentHasher>,
}

impl ArchiveTree {
    pub fn new(
        path: impl Into<PathBuf>,
        format: ArchiveFormat,
        cache: Arc<dyn DecompressionCache>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Self {
        Self {
            path: path.into(),
            format,
            cache,
            hasher,
        }
    }

    pub fn zip(
        path: impl Into<PathBuf>,
        cache: Arc<dyn DecompressionCache>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Self {
        Self::new(path, ArchiveFormat::Zip, cache, hasher)
    }

    pub fn tar(
        path: impl Into<PathBuf>,
        compression: TarCompression,
        cache: Arc<dyn DecompressionCache>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Self {
        Self::new(path, ArchiveFormat::Tar(compression), cache, hasher)
    }

    /// Open an archive whose format is detected from its file name.
    pub fn open(
        path: impl Into<PathBuf>,
        cache: Arc<dyn DecompressionCache>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self> {
        let path = path.into();
        let format = ArchiveFormat::detect(&path).ok_or_else(|| {
            FileTreeError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot tell the archive format of '{}'", path.display()),
            ))
        })?;
        Ok(Self::new(path, format, cache, hasher))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Name of the cache directory for the archive's current content.
    pub fn expanded_dir_name(&self) -> Result<String> {
        let digest = cache::hash_archive(self.hasher.as_ref(), &self.path)?;
        Ok(cache::expanded_dir_name(self.format.cache_prefix(), &digest))
    }

    /// Directory under the cache root that holds this archive's materialized entries.
    pub fn expanded_dir(&self) -> Result<PathBuf> {
        Ok(self.cache.base_dir().join(self.expanded_dir_name()?))
    }

    /// The expanded cache directory as an ordinary directory tree.
    pub fn mirror(&self) -> Result<DirectoryTree> {
        Ok(DirectoryTree::new(self.expanded_dir()?))
    }

    fn check_source(&self) -> Result<()> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FileTreeError::NotFound(self.display_name()));
            }
            Err(e) => return Err(FileTreeError::Io(e)),
        };
        if !metadata.is_file() {
            return Err(FileTreeError::NotAFile(self.display_name()));
        }
        Ok(())
    }

    fn walk(&self, visitor: &mut dyn FileVisitor) -> Result<()> {
        let cache_key = self.expanded_dir_name()?;
        let (reader, index) = ArchiveReader::open(&self.path, self.format)?;
        let traversal = Traversal {
            archive_path: &self.path,
            format: self.format,
            reader: RefCell::new(reader),
            expanded_dir: self.cache.base_dir().join(&cache_key),
            cache_key,
            cache: self.cache.as_ref(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        };
        let links = visitor.links_strategy();

        debug!(archive = %self.path.display(), entries = index.len(), "Visiting archive");

        for record in index.values() {
            if traversal.stop_flag.load(Ordering::Relaxed) {
                debug!(archive = %self.path.display(), "Traversal stopped by visitor");
                break;
            }

            let relative_path =
                sanitize_entry_name(&record.name, record.kind == EntryKind::Directory)?;

            let link_target = OnceCell::new();
            let preserve_link = record.kind == EntryKind::Symlink
                && match &links {
                    LinksStrategy::None => false,
                    LinksStrategy::All => true,
                    LinksStrategy::Predicate(predicate) => {
                        let target = traversal.read_link_target(record)?;
                        let keep = predicate(&target);
                        let _ = link_target.set(target);
                        keep
                    }
                };

            let element = ArchiveElement {
                traversal: &traversal,
                record,
                relative_path,
                preserve_link,
                link_target,
            };

            if element.is_directory() {
                visitor.visit_dir(&element)?;
            } else {
                visitor.visit_file(&element)?;
            }
        }

        Ok(())
    }
}

impl FileTree for ArchiveTree {
    fn display_name(&self) -> String {
        format!("{} '{}'", self.format.label(), self.path.display())
    }

    fn visit(&self, visitor: &mut dyn FileVisitor) -> Result<()> {
        self.check_source()?;

        self.cache
            .with_lease(&mut || self.walk(&mut *visitor))
            .map_err(|e| match e.kind() {
                ErrorKind::Input | ErrorKind::Expansion => e,
                _ => FileTreeError::expansion(self.display_name(), e),
            })
    }
}
