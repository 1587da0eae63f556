//! Shared decompression cache and content hashing.
//!
//! Expanded archives live in `<base dir>/<prefix>_<digest>`, where the digest is the
//! SHA-256 of the archive bytes. Access to the base directory is leased: readers hold
//! a shared lock for the duration of an operation, and whoever populates a given
//! content hash holds an exclusive per-hash lock while writing.

use crate::error::{FileTreeError, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const LEASE_FILE: &str = ".lease.lock";

/// Scoped access to a cache root shared across operations and processes.
pub trait DecompressionCache {
    /// Stable root under which content-hash-named directories live.
    fn base_dir(&self) -> &Path;

    /// Run `body` while holding a lease on the cache root.
    fn with_lease(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Run `body` while holding the exclusive populate lock for `key`.
    fn with_populate_lock(&self, key: &str, body: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// A [`DecompressionCache`] backed by a local directory and advisory file locks.
#[derive(Debug, Clone)]
pub struct DirectoryDecompressionCache {
    base_dir: PathBuf,
}

impl DirectoryDecompressionCache {
    /// Open (and create if needed) a cache rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn lock_file(&self, name: &str) -> Result<File> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.base_dir.join(name))?;
        Ok(file)
    }
}

impl DecompressionCache for DirectoryDecompressionCache {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn with_lease(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let lease = self.lock_file(LEASE_FILE)?;
        lease.lock_shared()?;
        let result = body();
        let _ = lease.unlock();
        result
    }

    fn with_populate_lock(&self, key: &str, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let lock = self.lock_file(&format!("{}.lock", key))?;
        lock.lock_exclusive()?;
        let result = body();
        let _ = lock.unlock();
        result
    }
}

/// Produces stable digests of archive content.
pub trait ContentHasher {
    /// Digest of everything readable from `source`.
    fn hash(&self, source: &mut dyn Read) -> io::Result<String>;

    /// Digest of a file's bytes.
    fn hash_file(&self, path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        self.hash(&mut file)
    }
}

/// Lowercase hex SHA-256 digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, source: &mut dyn Read) -> io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = source.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Name of the expanded cache directory for an archive with the given digest.
pub fn expanded_dir_name(prefix: &str, digest: &str) -> String {
    format!("{}_{}", prefix, digest)
}

pub(crate) fn hash_archive(hasher: &dyn ContentHasher, path: &Path) -> Result<String> {
    hasher.hash_file(path).map_err(FileTreeError::Io)
}
