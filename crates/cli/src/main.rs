//! Command-line interface for archive file trees.
//!
//! This CLI tool lists the elements of an archive or directory in visit order
//! and copies them to a destination through a copy specification.

use clap::{Parser, Subcommand};
use filetree::{
    copy_tree, error::report, ArchiveTree, Charset, CopyResult, CopySpec,
    DirectoryDecompressionCache, DirectoryTree, DuplicatesStrategy, EntryKind, FilePermissions,
    FileTree, FileTreeElement, FileVisitor, LinksStrategy, Sha256Hasher,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

const CACHE_DIR_ENV: &str = "FILETREE_CACHE_DIR";

#[derive(Parser)]
#[command(name = "filetree")]
#[command(version, about = "List and copy archive file trees", long_about = None)]
struct Cli {
    /// Decompression cache directory (default: $FILETREE_CACHE_DIR or <tmp>/filetree-cache)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the elements of an archive or directory in visit order
    List {
        /// Archive file or directory
        source: PathBuf,

        /// Links policy: none, all, relative
        #[arg(long, default_value = "none")]
        preserve_links: LinksStrategy,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy the elements of an archive or directory
    Copy {
        /// Archive file or directory
        source: PathBuf,

        /// Destination directory
        #[arg(short, long)]
        out: PathBuf,

        /// Destination prefix below the output directory
        #[arg(long)]
        into: Option<String>,

        /// Links policy: none, all, relative
        #[arg(long, default_value = "none")]
        preserve_links: LinksStrategy,

        /// Duplicates strategy: include, exclude, warn, fail, inherit
        #[arg(long, default_value = "inherit")]
        duplicates: DuplicatesStrategy,

        /// Octal permissions for copied files
        #[arg(long)]
        file_mode: Option<FilePermissions>,

        /// Octal permissions for copied directories
        #[arg(long)]
        dir_mode: Option<FilePermissions>,

        /// Create directories that end up empty
        #[arg(long)]
        include_empty_dirs: bool,

        /// Expand ${KEY} in file content (repeatable)
        #[arg(long = "expand", value_name = "KEY=VALUE", value_parser = parse_property)]
        properties: Vec<(String, String)>,

        /// Charset used to decode content for filtering
        #[arg(long, default_value = "utf-8")]
        charset: Charset,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cache_dir = cli.cache_dir.unwrap_or_else(default_cache_dir);

    let result = match cli.command {
        Commands::List {
            source,
            preserve_links,
            json,
        } => handle_list(&source, &cache_dir, preserve_links, json),
        Commands::Copy {
            source,
            out,
            into,
            preserve_links,
            duplicates,
            file_mode,
            dir_mode,
            include_empty_dirs,
            properties,
            charset,
            json,
        } => {
            let spec = build_spec(
                into.as_deref(),
                preserve_links,
                duplicates,
                file_mode,
                dir_mode,
                include_empty_dirs,
                properties,
                charset,
            );
            spec.and_then(|spec| handle_copy(&source, &cache_dir, &out, &spec, json))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", report(e.as_ref()));
        process::exit(1);
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os(CACHE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("filetree-cache"))
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Open `source` as a directory tree or, for files, as an archive.
fn open_tree(source: &Path, cache_dir: &Path) -> Result<Box<dyn FileTree>, Box<dyn Error>> {
    if source.is_dir() {
        return Ok(Box::new(DirectoryTree::new(source)));
    }
    tracing::debug!(cache_dir = %cache_dir.display(), "Using decompression cache");
    let cache = DirectoryDecompressionCache::new(cache_dir)?;
    let tree = ArchiveTree::open(source, Arc::new(cache), Arc::new(Sha256Hasher))?;
    Ok(Box::new(tree))
}

#[allow(clippy::too_many_arguments)]
fn build_spec(
    into: Option<&str>,
    preserve_links: LinksStrategy,
    duplicates: DuplicatesStrategy,
    file_mode: Option<FilePermissions>,
    dir_mode: Option<FilePermissions>,
    include_empty_dirs: bool,
    properties: Vec<(String, String)>,
    charset: Charset,
) -> Result<CopySpec, Box<dyn Error>> {
    let mut spec = CopySpec::new()
        .preserve_links(preserve_links)
        .duplicates_strategy(duplicates)
        .include_empty_dirs(include_empty_dirs)
        .filtering_charset(charset);

    if let Some(prefix) = into {
        spec = spec.destination(prefix)?;
    }
    if let Some(mode) = file_mode {
        spec = spec.file_mode(mode);
    }
    if let Some(mode) = dir_mode {
        spec = spec.dir_mode(mode);
    }
    if !properties.is_empty() {
        spec = spec.expand(properties.into_iter().collect::<BTreeMap<_, _>>());
    }
    Ok(spec)
}

#[derive(Serialize)]
struct ListedElement {
    path: String,
    kind: EntryKind,
    mode: FilePermissions,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_target: Option<String>,
}

struct Lister {
    links: LinksStrategy,
    elements: Vec<ListedElement>,
}

impl Lister {
    fn record(&mut self, element: &dyn FileTreeElement) -> filetree::Result<()> {
        let link_target = if element.is_symlink() {
            Some(element.symlink_target()?)
        } else {
            None
        };
        self.elements.push(ListedElement {
            path: element.path(),
            kind: element.kind(),
            mode: element.permissions(),
            size: element.size(),
            link_target,
        });
        Ok(())
    }
}

impl FileVisitor for Lister {
    fn visit_dir(&mut self, element: &dyn FileTreeElement) -> filetree::Result<()> {
        self.record(element)
    }

    fn visit_file(&mut self, element: &dyn FileTreeElement) -> filetree::Result<()> {
        self.record(element)
    }

    fn links_strategy(&self) -> LinksStrategy {
        self.links.clone()
    }
}

fn handle_list(
    source: &Path,
    cache_dir: &Path,
    preserve_links: LinksStrategy,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let tree = open_tree(source, cache_dir)?;
    let mut lister = Lister {
        links: preserve_links,
        elements: Vec::new(),
    };
    tree.visit(&mut lister)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&lister.elements)?);
        return Ok(());
    }

    for element in &lister.elements {
        let kind = match element.kind {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "link",
        };
        match &element.link_target {
            Some(target) => println!(
                "{:<4} {} {:>10} {} -> {}",
                kind, element.mode, element.size, element.path, target
            ),
            None => println!(
                "{:<4} {} {:>10} {}",
                kind, element.mode, element.size, element.path
            ),
        }
    }
    Ok(())
}

fn handle_copy(
    source: &Path,
    cache_dir: &Path,
    out: &Path,
    spec: &CopySpec,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let tree = open_tree(source, cache_dir)?;
    let report = copy_tree(tree.as_ref(), spec, out)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for outcome in &report.outcomes {
            if let CopyResult::Failed { message } = &outcome.result {
                eprintln!("Failed: {}", message);
            }
        }
        println!(
            "Copied {} elements to {} ({} skipped, {} failed) in {:.2}s",
            report.copied(),
            out.display(),
            report.skipped(),
            report.failed(),
            report.duration.as_secs_f64()
        );
    }

    if report.failed() > 0 {
        return Err(format!("{} elements could not be copied", report.failed()).into());
    }
    Ok(())
}
