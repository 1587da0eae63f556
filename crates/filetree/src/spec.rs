//! Copy specifications and their resolution.
//!
//! A [`CopySpec`] describes where and how elements are copied. Specs nest: a child
//! leaves a property unset (or sets [`DuplicatesStrategy::Inherit`]) to take it from
//! its nearest enclosing spec. [`CopySpecResolver`] performs that lookup every time a
//! property is queried, so changes made to a parent before resolution are honored.

use crate::details::FileCopyDetails;
use crate::error::SecurityError;
use crate::types::{Charset, DuplicatesStrategy, FilePermissions, LinksStrategy, RelativePath};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An action run against every element before it is copied.
pub type CopyAction = Arc<dyn Fn(&mut FileCopyDetails<'_>) + Send + Sync>;

/// Configuration of one level of a copy.
#[derive(Clone, Default)]
pub struct CopySpec {
    destination: RelativePath,
    file_permissions: Option<FilePermissions>,
    dir_permissions: Option<FilePermissions>,
    duplicates_strategy: DuplicatesStrategy,
    preserve_links: Option<LinksStrategy>,
    filtering_charset: Option<Charset>,
    include_empty_dirs: Option<bool>,
    actions: Vec<CopyAction>,
}

impl CopySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy below `prefix`, relative to the parent spec's destination.
    pub fn destination(mut self, prefix: &str) -> Result<Self, SecurityError> {
        self.destination = if prefix.trim_matches('/').is_empty() {
            RelativePath::root()
        } else {
            RelativePath::parse(false, prefix)?
        };
        Ok(self)
    }

    pub fn file_mode(mut self, permissions: FilePermissions) -> Self {
        self.file_permissions = Some(permissions);
        self
    }

    pub fn dir_mode(mut self, permissions: FilePermissions) -> Self {
        self.dir_permissions = Some(permissions);
        self
    }

    pub fn duplicates_strategy(mut self, strategy: DuplicatesStrategy) -> Self {
        self.duplicates_strategy = strategy;
        self
    }

    pub fn set_duplicates_strategy(&mut self, strategy: DuplicatesStrategy) {
        self.duplicates_strategy = strategy;
    }

    pub fn preserve_links(mut self, strategy: LinksStrategy) -> Self {
        self.preserve_links = Some(strategy);
        self
    }

    pub fn filtering_charset(mut self, charset: Charset) -> Self {
        self.filtering_charset = Some(charset);
        self
    }

    pub fn include_empty_dirs(mut self, include: bool) -> Self {
        self.include_empty_dirs = Some(include);
        self
    }

    /// Run `action` against every element copied with this spec.
    pub fn each_file(
        mut self,
        action: impl Fn(&mut FileCopyDetails<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    /// Register a line filter on every copied element.
    pub fn filter_lines(
        self,
        filter: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let filter = Arc::new(filter);
        self.each_file(move |details| {
            let filter = filter.clone();
            details.filter_lines(move |line| filter(line));
        })
    }

    /// Register property expansion on every copied element.
    pub fn expand(self, properties: BTreeMap<String, String>) -> Self {
        self.each_file(move |details| {
            details.expand(properties.clone(), false);
        })
    }
}

impl fmt::Debug for CopySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopySpec")
            .field("destination", &self.destination)
            .field("file_permissions", &self.file_permissions)
            .field("dir_permissions", &self.dir_permissions)
            .field("duplicates_strategy", &self.duplicates_strategy)
            .field("preserve_links", &self.preserve_links)
            .field("filtering_charset", &self.filtering_charset)
            .field("include_empty_dirs", &self.include_empty_dirs)
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Resolves the effective settings of a spec against its enclosing specs.
#[derive(Clone, Copy)]
pub struct CopySpecResolver<'a> {
    spec: &'a CopySpec,
    parent: Option<&'a CopySpecResolver<'a>>,
}

impl<'a> CopySpecResolver<'a> {
    pub fn root(spec: &'a CopySpec) -> Self {
        Self { spec, parent: None }
    }

    /// Resolver for `spec` nested inside this one.
    pub fn child(&'a self, spec: &'a CopySpec) -> CopySpecResolver<'a> {
        Self {
            spec,
            parent: Some(self),
        }
    }

    fn inherited<T>(&self, get: impl Fn(&CopySpec) -> Option<T>) -> Option<T> {
        get(self.spec).or_else(|| self.parent.and_then(|p| p.inherited(get)))
    }

    /// Destination prefix: the parent's destination followed by this spec's.
    pub fn dest_path(&self) -> RelativePath {
        match self.parent {
            Some(parent) => parent.dest_path().append(&self.spec.destination),
            None => self.spec.destination.clone(),
        }
    }

    pub fn file_permissions(&self) -> Option<FilePermissions> {
        self.inherited(|s| s.file_permissions)
    }

    pub fn dir_permissions(&self) -> Option<FilePermissions> {
        self.inherited(|s| s.dir_permissions)
    }

    /// Spec-level permissions for an element of the given kind.
    pub fn permissions_for(&self, is_directory: bool) -> Option<FilePermissions> {
        if is_directory {
            self.dir_permissions()
        } else {
            self.file_permissions()
        }
    }

    /// Effective strategy; `Include` when no spec in the chain sets one.
    pub fn duplicates_strategy(&self) -> DuplicatesStrategy {
        self.explicit_duplicates_strategy()
            .unwrap_or(DuplicatesStrategy::Include)
    }

    /// Whether the strategy is the default rather than set by some spec.
    pub fn is_default_duplicates_strategy(&self) -> bool {
        self.explicit_duplicates_strategy().is_none()
    }

    fn explicit_duplicates_strategy(&self) -> Option<DuplicatesStrategy> {
        self.inherited(|s| match s.duplicates_strategy {
            DuplicatesStrategy::Inherit => None,
            strategy => Some(strategy),
        })
    }

    pub fn preserve_links(&self) -> LinksStrategy {
        self.inherited(|s| s.preserve_links.clone()).unwrap_or_default()
    }

    pub fn filtering_charset(&self) -> Charset {
        self.inherited(|s| s.filtering_charset).unwrap_or_default()
    }

    pub fn include_empty_dirs(&self) -> bool {
        self.inherited(|s| s.include_empty_dirs).unwrap_or(true)
    }

    /// Actions of every enclosing spec, outermost first.
    pub fn actions(&self) -> Vec<CopyAction> {
        let mut actions = self.parent.map(|p| p.actions()).unwrap_or_default();
        actions.extend(self.spec.actions.iter().cloned());
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_is_nested() {
        let parent = CopySpec::new().destination("out").unwrap();
        let child = CopySpec::new().destination("lib/ext").unwrap();
        let root = CopySpecResolver::root(&parent);
        let resolver = root.child(&child);
        assert_eq!(resolver.dest_path().path_string(), "out/lib/ext");
        assert!(CopySpec::new().destination("../escape").is_err());
        assert!(CopySpec::new().destination("/").unwrap().destination.is_empty());
    }

    #[test]
    fn test_properties_inherit_from_nearest_spec() {
        let parent = CopySpec::new()
            .file_mode(FilePermissions::new(0o600))
            .dir_mode(FilePermissions::new(0o700))
            .filtering_charset(Charset::Latin1)
            .include_empty_dirs(false);
        let child = CopySpec::new().file_mode(FilePermissions::new(0o640));
        let root = CopySpecResolver::root(&parent);
        let resolver = root.child(&child);

        assert_eq!(resolver.file_permissions(), Some(FilePermissions::new(0o640)));
        assert_eq!(resolver.dir_permissions(), Some(FilePermissions::new(0o700)));
        assert_eq!(resolver.permissions_for(true), Some(FilePermissions::new(0o700)));
        assert_eq!(resolver.filtering_charset(), Charset::Latin1);
        assert!(!resolver.include_empty_dirs());
    }

    #[test]
    fn test_unset_properties_have_defaults() {
        let spec = CopySpec::new();
        let resolver = CopySpecResolver::root(&spec);
        assert_eq!(resolver.file_permissions(), None);
        assert_eq!(resolver.duplicates_strategy(), DuplicatesStrategy::Include);
        assert!(resolver.is_default_duplicates_strategy());
        assert!(matches!(resolver.preserve_links(), LinksStrategy::None));
        assert_eq!(resolver.filtering_charset(), Charset::Utf8);
        assert!(resolver.include_empty_dirs());
        assert!(resolver.dest_path().is_empty());
        assert_eq!(spec.destination, RelativePath::root());
    }

    #[test]
    fn test_inherit_resolves_at_resolution_time() {
        let mut parent = CopySpec::new().duplicates_strategy(DuplicatesStrategy::Warn);
        let child = CopySpec::new().duplicates_strategy(DuplicatesStrategy::Inherit);

        // The parent changes after the child was configured to inherit
        parent.set_duplicates_strategy(DuplicatesStrategy::Exclude);

        let root = CopySpecResolver::root(&parent);
        let resolver = root.child(&child);
        assert_eq!(resolver.duplicates_strategy(), DuplicatesStrategy::Exclude);
        assert!(!resolver.is_default_duplicates_strategy());

        let explicit = CopySpec::new().duplicates_strategy(DuplicatesStrategy::Fail);
        assert_eq!(
            root.child(&explicit).duplicates_strategy(),
            DuplicatesStrategy::Fail
        );
    }

    #[test]
    fn test_actions_are_collected_outermost_first() {
        let parent = CopySpec::new().each_file(|d| d.exclude());
        let child = CopySpec::new()
            .each_file(|_| {})
            .expand(BTreeMap::new());
        let root = CopySpecResolver::root(&parent);
        assert_eq!(root.actions().len(), 1);
        assert_eq!(root.child(&child).actions().len(), 3);
    }
}
