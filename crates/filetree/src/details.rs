//! Per-element copy state: destination identity, permissions, filters and transfer.

use crate::element::FileTreeElement;
use crate::error::{FileTreeError, Result};
use crate::filter::{ByteCountingSink, FilterChain};
use crate::fsops;
use crate::spec::CopySpecResolver;
use crate::types::{DuplicatesStrategy, FilePermissions, RelativePath};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One element combined with the spec it is copied under.
///
/// The destination path is computed once on first use and only recomputed after
/// [`set_relative_path`](Self::set_relative_path), [`set_name`](Self::set_name) or
/// [`set_path`](Self::set_path).
pub struct FileCopyDetails<'a> {
    element: &'a dyn FileTreeElement,
    resolver: &'a CopySpecResolver<'a>,
    filter_chain: FilterChain,
    relative_path: OnceCell<RelativePath>,
    permissions: Option<FilePermissions>,
    duplicates_strategy: Option<DuplicatesStrategy>,
    excluded: bool,
}

impl<'a> FileCopyDetails<'a> {
    pub fn new(element: &'a dyn FileTreeElement, resolver: &'a CopySpecResolver<'a>) -> Self {
        Self {
            element,
            resolver,
            filter_chain: FilterChain::new(resolver.filtering_charset()),
            relative_path: OnceCell::new(),
            permissions: None,
            duplicates_strategy: None,
            excluded: false,
        }
    }

    /// The source element.
    pub fn element(&self) -> &'a dyn FileTreeElement {
        self.element
    }

    pub fn display_name(&self) -> String {
        self.element.display_name()
    }

    /// Destination path relative to the copy root.
    pub fn relative_path(&self) -> &RelativePath {
        self.relative_path.get_or_init(|| {
            self.resolver
                .dest_path()
                .append(self.element.relative_path())
        })
    }

    pub fn set_relative_path(&mut self, path: RelativePath) {
        self.relative_path = OnceCell::from(path);
    }

    /// Rename the destination, keeping its directory.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let renamed = self.relative_path().replace_last_name(name)?;
        self.set_relative_path(renamed);
        Ok(())
    }

    /// Replace the whole destination path.
    pub fn set_path(&mut self, path: &str) -> Result<()> {
        let parsed = RelativePath::parse(!self.element.is_directory(), path)?;
        self.set_relative_path(parsed);
        Ok(())
    }

    /// Destination name.
    pub fn name(&self) -> &str {
        self.relative_path().last_name()
    }

    /// Destination path joined with `/`.
    pub fn path(&self) -> String {
        self.relative_path().path_string()
    }

    pub fn source_name(&self) -> &str {
        self.element.name()
    }

    pub fn source_path(&self) -> String {
        self.element.path()
    }

    pub fn relative_source_path(&self) -> &RelativePath {
        self.element.relative_path()
    }

    pub fn is_directory(&self) -> bool {
        self.element.is_directory()
    }

    pub fn is_symlink(&self) -> bool {
        self.element.is_symlink()
    }

    pub fn symlink_target(&self) -> Result<String> {
        self.element.symlink_target()
    }

    pub fn last_modified(&self) -> i64 {
        self.element.last_modified()
    }

    pub fn stop_visiting(&self) {
        self.element.stop_visiting();
    }

    pub fn include_empty_dirs(&self) -> bool {
        self.resolver.include_empty_dirs()
    }

    /// Skip this element.
    pub fn exclude(&mut self) {
        self.excluded = true;
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.set_permissions(FilePermissions::new(mode));
    }

    pub fn set_permissions(&mut self, permissions: FilePermissions) {
        self.permissions = Some(permissions);
    }

    /// Permissions set directly on this element, if any.
    pub fn explicit_permissions(&self) -> Option<FilePermissions> {
        self.permissions
    }

    /// Resolved permissions: explicit, then the spec's for this kind, then the source's.
    pub fn permissions(&self) -> FilePermissions {
        self.permissions
            .or_else(|| self.resolver.permissions_for(self.is_directory()))
            .unwrap_or_else(|| self.element.permissions())
    }

    pub fn mode(&self) -> u32 {
        self.permissions().mode()
    }

    /// Set the strategy for this element. `Inherit` reverts to the spec's strategy.
    pub fn set_duplicates_strategy(&mut self, strategy: DuplicatesStrategy) {
        self.duplicates_strategy = match strategy {
            DuplicatesStrategy::Inherit => None,
            strategy => Some(strategy),
        };
    }

    /// The strategy set on this element, `Inherit` when none was.
    pub fn duplicates_strategy(&self) -> DuplicatesStrategy {
        self.duplicates_strategy
            .unwrap_or(DuplicatesStrategy::Inherit)
    }

    /// Whether neither this element nor any enclosing spec set a strategy.
    pub fn is_default_duplicates_strategy(&self) -> bool {
        self.duplicates_strategy.is_none() && self.resolver.is_default_duplicates_strategy()
    }

    /// The strategy to apply, with `Inherit` resolved against the spec right now.
    pub fn effective_duplicates_strategy(&self) -> DuplicatesStrategy {
        self.duplicates_strategy
            .unwrap_or_else(|| self.resolver.duplicates_strategy())
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.filter_chain
    }

    pub fn filter_lines(
        &mut self,
        filter: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> &mut Self {
        self.filter_chain.add_line_filter(filter);
        self
    }

    pub fn filter(
        &mut self,
        transformer: impl Fn(String) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.filter_chain.add_transformer(transformer);
        self
    }

    pub fn expand(
        &mut self,
        properties: BTreeMap<String, String>,
        escape_backslash: bool,
    ) -> &mut Self {
        self.filter_chain.expand(properties, escape_backslash);
        self
    }

    pub fn replace_tokens(
        &mut self,
        tokens: BTreeMap<String, String>,
        begin: &str,
        end: &str,
    ) -> &mut Self {
        self.filter_chain.replace_tokens(tokens, begin, end);
        self
    }

    /// Size of the content as it will be written.
    ///
    /// Without filters this is the source-reported size. With filters the content is
    /// rendered once into a counting sink.
    pub fn size(&self) -> Result<u64> {
        if !self.filter_chain.has_filters() {
            return Ok(self.element.size());
        }
        let mut counter = ByteCountingSink::default();
        self.copy_to(&mut counter)?;
        Ok(counter.count())
    }

    /// A path on disk with the source content. Not available once filters are
    /// registered, as that content would differ from what is copied.
    pub fn file(&self) -> Result<PathBuf> {
        if self.filter_chain.has_filters() {
            return Err(FileTreeError::FilteredContent(self.display_name()));
        }
        self.element.file()
    }

    /// Stream the filtered content into `sink`.
    pub fn copy_to(&self, sink: &mut dyn Write) -> Result<u64> {
        if !self.filter_chain.has_filters() {
            return self.element.copy_to(sink);
        }
        let mut source = self.element.open()?;
        self.filter_chain.transform(&mut source, sink)
    }

    /// Materialize this element at `target`.
    pub fn copy_to_path(&self, target: &Path) -> Result<()> {
        let timestamp = self.last_modified();
        if timestamp < 0 {
            return Err(FileTreeError::InvalidTimestamp {
                timestamp,
                name: self.display_name(),
            });
        }

        self.transfer(target)
            .map_err(|source| FileTreeError::Transfer {
                name: self.display_name(),
                target: target.to_path_buf(),
                source: Box::new(source),
            })
    }

    fn transfer(&self, target: &Path) -> Result<()> {
        if self.is_symlink() {
            let link_target = self.symlink_target()?;
            debug!(target = %target.display(), link = %link_target, "Preserving symbolic link");
            fsops::ensure_parent(target)?;
            return fsops::replace_with_symlink(&link_target, target);
        }

        // Never follow a link left at the destination by an earlier copy
        if fs::symlink_metadata(target).is_ok_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(target)?;
        }

        let permissions = self.permissions();
        if self.is_directory() {
            fs::create_dir_all(target)?;
        } else {
            fsops::ensure_parent(target)?;
            fsops::write_atomically(target, &mut |sink| self.copy_to(sink))?;
        }
        fsops::apply_permissions(target, permissions)
    }
}

impl fmt::Debug for FileCopyDetails<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCopyDetails")
            .field("source", &self.element.display_name())
            .field("relative_path", &self.relative_path.get())
            .field("permissions", &self.permissions)
            .field("duplicates_strategy", &self.duplicates_strategy)
            .field("filter_chain", &self.filter_chain)
            .field("excluded", &self.excluded)
            .finish()
    }
}
