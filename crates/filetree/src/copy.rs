//! Copying whole trees to a destination directory.

use crate::details::FileCopyDetails;
use crate::element::FileTreeElement;
use crate::error::{report, FileTreeError, Result};
use crate::fsops;
use crate::safety::{ensure_no_linked_ancestors, ensure_within};
use crate::spec::{CopyAction, CopySpec, CopySpecResolver};
use crate::tree::{FileTree, FileVisitor};
use crate::types::{
    CopyOutcome, CopyReport, CopyResult, DuplicatesStrategy, FilePermissions, LinksStrategy,
    RelativePath,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Copy every element of `tree` below `dest_root` as configured by `spec`.
///
/// Failures of single elements are recorded in the report and do not stop the
/// batch. Failures of the traversal itself abort it.
///
/// # Example
///
/// ```no_run
/// use filetree::{copy_tree, CopySpec, DirectoryTree, DuplicatesStrategy};
/// use std::path::Path;
///
/// let spec = CopySpec::new().duplicates_strategy(DuplicatesStrategy::Exclude);
/// let report = copy_tree(&DirectoryTree::new("assets"), &spec, Path::new("build"))?;
/// println!("Copied {} elements", report.copied());
/// # Ok::<(), filetree::FileTreeError>(())
/// ```
pub fn copy_tree(tree: &dyn FileTree, spec: &CopySpec, dest_root: &Path) -> Result<CopyReport> {
    let mut batch = CopyBatch::new(dest_root);
    batch.copy(tree, &CopySpecResolver::root(spec))?;
    Ok(batch.finish())
}

/// A copy of one or more trees into the same destination.
///
/// Duplicate detection spans every tree copied through the same batch.
#[derive(Debug)]
pub struct CopyBatch {
    dest_root: PathBuf,
    seen: HashSet<RelativePath>,
    outcomes: Vec<CopyOutcome>,
    started: Instant,
}

impl CopyBatch {
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        Self {
            dest_root: dest_root.into(),
            seen: HashSet::new(),
            outcomes: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Copy `tree` with the settings of `resolver`.
    pub fn copy(&mut self, tree: &dyn FileTree, resolver: &CopySpecResolver<'_>) -> Result<()> {
        fs::create_dir_all(&self.dest_root)?;
        info!(source = %tree.display_name(), dest = %self.dest_root.display(), "Copying tree");

        let mut visitor = CopyVisitor {
            batch: self,
            resolver,
            actions: resolver.actions(),
            links: resolver.preserve_links(),
            include_empty_dirs: resolver.include_empty_dirs(),
            pending_dirs: Vec::new(),
        };
        tree.visit(&mut visitor)
    }

    pub fn finish(self) -> CopyReport {
        let report = CopyReport {
            outcomes: self.outcomes,
            duration: self.started.elapsed(),
        };
        info!(
            copied = report.copied(),
            skipped = report.skipped(),
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "Copy finished"
        );
        report
    }

    fn record(
        &mut self,
        source: String,
        target: PathBuf,
        mode: Option<FilePermissions>,
        result: CopyResult,
    ) {
        self.outcomes.push(CopyOutcome {
            source,
            target,
            mode,
            result,
        });
    }
}

/// A directory whose creation waits until something is copied into it.
struct PendingDir {
    source: String,
    target: PathBuf,
    permissions: FilePermissions,
}

struct CopyVisitor<'b, 'r> {
    batch: &'b mut CopyBatch,
    resolver: &'r CopySpecResolver<'r>,
    actions: Vec<CopyAction>,
    links: LinksStrategy,
    include_empty_dirs: bool,
    pending_dirs: Vec<PendingDir>,
}

/// Build the details of `element` and run the spec's actions on them.
fn prepare<'e>(
    resolver: &'e CopySpecResolver<'e>,
    actions: &[CopyAction],
    element: &'e dyn FileTreeElement,
) -> FileCopyDetails<'e> {
    let mut details = FileCopyDetails::new(element, resolver);
    for action in actions {
        action(&mut details);
        if details.is_excluded() {
            break;
        }
    }
    details
}

impl CopyVisitor<'_, '_> {
    fn target_for(&self, details: &FileCopyDetails<'_>) -> Result<PathBuf> {
        let root = &self.batch.dest_root;
        let target = details.relative_path().resolve_under(root);
        ensure_within(root, &target)?;
        ensure_no_linked_ancestors(root, &target)?;
        Ok(target)
    }

    fn fail(&mut self, source: String, target: PathBuf, error: FileTreeError) {
        let message = report(&error);
        warn!(source = %source, error = %message, "Element copy failed");
        self.batch
            .record(source, target, None, CopyResult::Failed { message });
    }

    /// Create the deferred directories that contain `target`.
    fn create_pending_ancestors(&mut self, target: &Path) -> Result<()> {
        let (ancestors, rest): (Vec<_>, Vec<_>) = self
            .pending_dirs
            .drain(..)
            .partition(|dir| target.starts_with(&dir.target));
        self.pending_dirs = rest;

        for dir in ancestors {
            if fs::symlink_metadata(&dir.target).is_ok_and(|m| m.file_type().is_symlink()) {
                fs::remove_file(&dir.target)?;
            }
            fs::create_dir_all(&dir.target)?;
            fsops::apply_permissions(&dir.target, dir.permissions)?;
            self.batch
                .record(dir.source, dir.target, Some(dir.permissions), CopyResult::Copied);
        }
        Ok(())
    }

    fn copy_file(&mut self, details: &FileCopyDetails<'_>, target: PathBuf) {
        let source = details.source_path();
        let strategy = details.effective_duplicates_strategy();
        let first_visit = self.batch.seen.insert(details.relative_path().clone());

        if !first_visit {
            match strategy {
                DuplicatesStrategy::Exclude => {
                    debug!(path = %details.path(), "Skipping duplicate");
                    self.batch
                        .record(source, target, None, CopyResult::SkippedDuplicate);
                    return;
                }
                DuplicatesStrategy::Fail => {
                    let error = FileTreeError::Duplicate(details.path());
                    self.fail(source, target, error);
                    return;
                }
                DuplicatesStrategy::Warn => {
                    warn!(path = %details.path(), "Encountered duplicate path");
                }
                DuplicatesStrategy::Include | DuplicatesStrategy::Inherit
                    if details.is_default_duplicates_strategy() =>
                {
                    warn!(
                        path = %details.path(),
                        "Duplicate path copied again as no duplicates strategy is set"
                    );
                }
                DuplicatesStrategy::Include | DuplicatesStrategy::Inherit => {}
            }
        }

        if let Err(e) = self.create_pending_ancestors(&target) {
            self.fail(source, target, e);
            return;
        }

        debug!(source = %details.display_name(), target = %target.display(), "Copying element");
        match details.copy_to_path(&target) {
            Ok(()) => {
                let mode = (!details.is_symlink()).then(|| details.permissions());
                self.batch.record(source, target, mode, CopyResult::Copied);
            }
            Err(e) => self.fail(source, target, e),
        }
    }
}

impl FileVisitor for CopyVisitor<'_, '_> {
    fn visit_dir(&mut self, element: &dyn FileTreeElement) -> Result<()> {
        let details = prepare(self.resolver, &self.actions, element);
        let source = details.source_path();
        if details.is_excluded() {
            let target = details.relative_path().resolve_under(&self.batch.dest_root);
            self.batch.record(source, target, None, CopyResult::Excluded);
            return Ok(());
        }

        let target = match self.target_for(&details) {
            Ok(target) => target,
            Err(e) => {
                let target = details.relative_path().resolve_under(&self.batch.dest_root);
                self.fail(source, target, e);
                return Ok(());
            }
        };

        if self.include_empty_dirs {
            match details.copy_to_path(&target) {
                Ok(()) => {
                    let mode = Some(details.permissions());
                    self.batch.record(source, target, mode, CopyResult::Copied);
                }
                Err(e) => self.fail(source, target, e),
            }
        } else {
            self.pending_dirs.push(PendingDir {
                source,
                target,
                permissions: details.permissions(),
            });
        }
        Ok(())
    }

    fn visit_file(&mut self, element: &dyn FileTreeElement) -> Result<()> {
        let details = prepare(self.resolver, &self.actions, element);
        let source = details.source_path();
        if details.is_excluded() {
            let target = details.relative_path().resolve_under(&self.batch.dest_root);
            self.batch.record(source, target, None, CopyResult::Excluded);
            return Ok(());
        }

        match self.target_for(&details) {
            Ok(target) => self.copy_file(&details, target),
            Err(e) => {
                let target = details.relative_path().resolve_under(&self.batch.dest_root);
                self.fail(source, target, e);
            }
        }
        Ok(())
    }

    fn links_strategy(&self) -> LinksStrategy {
        self.links.clone()
    }
}
