use filetree::{
    ArchiveTree, DirectoryDecompressionCache, EntryKind, ErrorKind, FileTree, FileTreeElement,
    FileTreeError, FileVisitor, LinksStrategy, Result, Sha256Hasher, TarCompression,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn cache(temp_dir: &TempDir) -> Arc<DirectoryDecompressionCache> {
    Arc::new(DirectoryDecompressionCache::new(temp_dir.path().join("cache")).unwrap())
}

fn zip_tree(temp_dir: &TempDir, path: &Path) -> ArchiveTree {
    ArchiveTree::zip(path, cache(temp_dir), Arc::new(Sha256Hasher))
}

/// Entries are `(name, content)`; names ending in `/` become directories.
fn create_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().unix_permissions(0o644);

    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options.unix_permissions(0o755))
                .unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
    }
    zip.finish().unwrap();
}

fn create_zip_with_link(path: &Path) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().unix_permissions(0o644);

    zip.start_file("dir/real.txt", options).unwrap();
    zip.write_all(b"real content").unwrap();
    zip.add_symlink("dir/link", "real.txt", options).unwrap();
    zip.finish().unwrap();
}

/// Visit `tree`, handing every element to `f`.
fn visit_all(
    tree: &dyn FileTree,
    links: LinksStrategy,
    mut f: impl FnMut(&dyn FileTreeElement) -> Result<()>,
) -> Result<()> {
    struct Adapter<'f> {
        f: &'f mut dyn FnMut(&dyn FileTreeElement) -> Result<()>,
        links: LinksStrategy,
    }

    impl FileVisitor for Adapter<'_> {
        fn visit_dir(&mut self, element: &dyn FileTreeElement) -> Result<()> {
            (self.f)(element)
        }

        fn visit_file(&mut self, element: &dyn FileTreeElement) -> Result<()> {
            (self.f)(element)
        }

        fn links_strategy(&self) -> LinksStrategy {
            self.links.clone()
        }
    }

    tree.visit(&mut Adapter { f: &mut f, links })
}

fn visit_order(tree: &dyn FileTree) -> Vec<(String, EntryKind)> {
    let mut visited = Vec::new();
    visit_all(tree, LinksStrategy::None, |element| {
        visited.push((element.path(), element.kind()));
        Ok(())
    })
    .unwrap();
    visited
}

#[test]
fn test_entries_are_visited_in_sorted_order() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("unsorted.zip");
    create_zip(
        &archive,
        &[("b/file.txt", b"b"), ("a/file.txt", b"a"), ("a/", b"")],
    );

    let tree = zip_tree(&temp_dir, &archive);
    assert_eq!(
        visit_order(&tree),
        vec![
            ("a".to_string(), EntryKind::Directory),
            ("a/file.txt".to_string(), EntryKind::File),
            ("b/file.txt".to_string(), EntryKind::File),
        ]
    );
}

#[test]
fn test_revisiting_is_reproducible() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("test.zip");
    create_zip(&archive, &[("z.txt", b"z"), ("m/", b""), ("m/n.txt", b"n")]);

    let tree = zip_tree(&temp_dir, &archive);
    let first = visit_order(&tree);
    let first_dir = tree.expanded_dir_name().unwrap();
    let second = visit_order(&tree);

    assert_eq!(first, second);
    assert_eq!(first_dir, tree.expanded_dir_name().unwrap());
}

#[test]
fn test_identical_bytes_share_cache_directory() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("first.zip");
    let second = temp_dir.path().join("second.zip");
    create_zip(&first, &[("file.txt", b"same")]);
    fs::copy(&first, &second).unwrap();

    let first_name = zip_tree(&temp_dir, &first).expanded_dir_name().unwrap();
    let second_name = zip_tree(&temp_dir, &second).expanded_dir_name().unwrap();
    assert_eq!(first_name, second_name);
    assert!(first_name.starts_with("zip_"));

    // Flip one byte of the second archive
    let mut bytes = fs::read(&second).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&second, bytes).unwrap();

    let changed_name = zip_tree(&temp_dir, &second).expanded_dir_name().unwrap();
    assert_ne!(first_name, changed_name);
}

#[test]
fn test_zip_slip_entries_abort_traversal() {
    let unsafe_names = ["../evil.txt", "safe/../../evil.txt", "/etc/evil.txt"];

    for name in unsafe_names {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("evil.zip");
        create_zip(&archive, &[("good.txt", b"good"), (name, b"evil")]);

        let tree = zip_tree(&temp_dir, &archive);
        let err = visit_all(&tree, LinksStrategy::None, |element| {
            element.file()?;
            Ok(())
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Expansion, "entry {}", name);
        assert_eq!(err.root_cause().kind(), ErrorKind::PathSafety, "entry {}", name);
        assert!(err.to_string().starts_with("Cannot expand ZIP"));
        assert!(!temp_dir.path().join("evil.txt").exists());
        assert!(!temp_dir.path().join("cache/evil.txt").exists());
    }
}

#[test]
fn test_missing_source_is_input_error() {
    let temp_dir = TempDir::new().unwrap();
    let tree = zip_tree(&temp_dir, &temp_dir.path().join("missing.zip"));

    let err = visit_all(&tree, LinksStrategy::None, |_| Ok(())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(err.to_string().contains("as it does not exist."));

    let dir = temp_dir.path().join("dir.zip");
    fs::create_dir(&dir).unwrap();
    let err = visit_all(&zip_tree(&temp_dir, &dir), LinksStrategy::None, |_| Ok(())).unwrap_err();
    assert!(matches!(err, FileTreeError::NotAFile(_)));
}

#[test]
fn test_corrupted_archive_is_expansion_error() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("broken.zip");
    fs::write(&archive, b"this is not a zip archive").unwrap();

    let err = visit_all(&zip_tree(&temp_dir, &archive), LinksStrategy::None, |_| Ok(()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expansion);
}

#[test]
fn test_file_materializes_under_expanded_dir() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("test.zip");
    create_zip(&archive, &[("a/", b""), ("a/file.txt", b"content")]);

    let tree = zip_tree(&temp_dir, &archive);
    let expanded_dir = tree.expanded_dir().unwrap();

    let mut files: Vec<PathBuf> = Vec::new();
    visit_all(&tree, LinksStrategy::None, |element| {
        files.push(element.file()?);
        Ok(())
    })
    .unwrap();

    assert_eq!(files, vec![expanded_dir.join("a"), expanded_dir.join("a/file.txt")]);
    assert!(files[0].is_dir());
    assert_eq!(fs::read(&files[1]).unwrap(), b"content");

    // The expanded directory can be visited as a plain directory tree
    let mirror = tree.mirror().unwrap();
    assert_eq!(mirror.root(), expanded_dir.as_path());
    assert_eq!(
        visit_order(&mirror),
        vec![
            ("a".to_string(), EntryKind::Directory),
            ("a/file.txt".to_string(), EntryKind::File),
        ]
    );
}

#[test]
fn test_element_metadata() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("test.zip");
    create_zip(&archive, &[("dir/file.txt", b"hello")]);

    let tree = zip_tree(&temp_dir, &archive);
    visit_all(&tree, LinksStrategy::None, |element| {
        assert_eq!(element.name(), "file.txt");
        assert_eq!(element.size(), 5);
        assert_eq!(element.permissions().mode(), 0o644);
        assert!(element.last_modified() >= 0);
        assert_eq!(
            element.display_name(),
            format!("zip entry {}!dir/file.txt", archive.display())
        );

        let mut content = Vec::new();
        element.copy_to(&mut content)?;
        assert_eq!(content, b"hello");
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_symlink_target_on_plain_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("test.zip");
    create_zip(&archive, &[("plain.txt", b"plain")]);

    let mut errors = Vec::new();
    visit_all(&zip_tree(&temp_dir, &archive), LinksStrategy::All, |element| {
        assert!(!element.is_symlink());
        errors.push(element.symlink_target().unwrap_err());
        Ok(())
    })
    .unwrap();

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], FileTreeError::NotASymlink(_)));
    assert_eq!(errors[0].kind(), ErrorKind::InvalidState);
    assert!(errors[0].to_string().starts_with("Not a symbolic link: zip entry"));
}

#[test]
fn test_links_policy_types_symlink_entries() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("links.zip");
    create_zip_with_link(&archive);
    let tree = zip_tree(&temp_dir, &archive);

    let mut flattened = Vec::new();
    visit_all(&tree, LinksStrategy::None, |element| {
        if element.name() == "link" {
            assert!(!element.is_symlink());
            element.copy_to(&mut flattened)?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(flattened, b"real.txt");

    for links in [LinksStrategy::All, LinksStrategy::relative()] {
        let mut targets = Vec::new();
        visit_all(&tree, links, |element| {
            if element.is_symlink() {
                targets.push(element.symlink_target()?);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(targets, vec!["real.txt".to_string()]);
    }

    let mut preserved = 0;
    visit_all(&tree, LinksStrategy::predicate(|t| t.starts_with('/')), |element| {
        if element.is_symlink() {
            preserved += 1;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(preserved, 0);
}

#[test]
fn test_stop_visiting_prevents_further_entries() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("test.zip");
    create_zip(&archive, &[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c")]);

    let mut visited = Vec::new();
    visit_all(&zip_tree(&temp_dir, &archive), LinksStrategy::None, |element| {
        visited.push(element.path());
        if element.name() == "b.txt" {
            element.stop_visiting();
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(visited, vec!["a.txt", "b.txt"]);
}

fn append_sample_entries<W: Write>(builder: &mut tar::Builder<W>) {
    let mut append = |name: &str, content: &[u8], mode: u32| {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(mode);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    };
    append("z/last.txt", b"last", 0o600);
    append("a/first.txt", b"first", 0o644);
    append("m.txt", b"zero mode", 0);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_cksum();
    builder
        .append_link(&mut header, "a/link", "first.txt")
        .unwrap();
}

fn create_tar(path: &Path, compression: TarCompression) {
    let file = File::create(path).unwrap();
    match compression {
        TarCompression::None => {
            let mut builder = tar::Builder::new(file);
            append_sample_entries(&mut builder);
            builder.finish().unwrap();
        }
        TarCompression::Gzip => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_sample_entries(&mut builder);
            builder.into_inner().unwrap().finish().unwrap();
        }
        TarCompression::Bzip2 => {
            let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_sample_entries(&mut builder);
            builder.into_inner().unwrap().finish().unwrap();
        }
    }
}

#[test]
fn test_tar_tree_is_sorted_and_typed() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("test.tar.gz");
    create_tar(&archive, TarCompression::Gzip);

    let tree = ArchiveTree::open(&archive, cache(&temp_dir), Arc::new(Sha256Hasher)).unwrap();
    assert_eq!(
        tree.format(),
        filetree::ArchiveFormat::Tar(TarCompression::Gzip)
    );
    assert!(tree.expanded_dir_name().unwrap().starts_with("tar_"));

    let mut visited = Vec::new();
    visit_all(&tree, LinksStrategy::All, |element| {
        visited.push((element.path(), element.kind(), element.permissions().mode()));
        if element.is_symlink() {
            assert_eq!(element.symlink_target()?, "first.txt");
        } else {
            assert_eq!(element.last_modified(), 1_700_000_000_000);
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(
        visited,
        vec![
            ("a/first.txt".to_string(), EntryKind::File, 0o644),
            ("a/link".to_string(), EntryKind::Symlink, 0o777),
            ("m.txt".to_string(), EntryKind::File, 0o644),
            ("z/last.txt".to_string(), EntryKind::File, 0o600),
        ]
    );
}

#[test]
fn test_tar_content_is_read_in_visit_order_for_every_compression() {
    let cases = [
        ("plain.tar", TarCompression::None),
        ("gzip.tar.gz", TarCompression::Gzip),
        ("bzip2.tar.bz2", TarCompression::Bzip2),
    ];

    for (name, compression) in cases {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join(name);
        create_tar(&archive, compression);

        let tree = ArchiveTree::open(&archive, cache(&temp_dir), Arc::new(Sha256Hasher)).unwrap();
        assert_eq!(tree.format(), filetree::ArchiveFormat::Tar(compression));

        let mut contents = Vec::new();
        visit_all(&tree, LinksStrategy::None, |element| {
            let mut content = Vec::new();
            element.copy_to(&mut content)?;
            assert_eq!(element.size(), content.len() as u64);
            contents.push((element.path(), content));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            contents,
            vec![
                ("a/first.txt".to_string(), b"first".to_vec()),
                ("a/link".to_string(), b"first.txt".to_vec()),
                ("m.txt".to_string(), b"zero mode".to_vec()),
                ("z/last.txt".to_string(), b"last".to_vec()),
            ],
            "archive {}",
            name
        );
    }
}

#[cfg(unix)]
#[test]
fn test_non_utf8_tar_name_aborts_traversal() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("names.tar");
    let mut builder = tar::Builder::new(File::create(&archive).unwrap());
    for raw in [&b"bad\xff.txt"[..], &b"bad\xfe.txt"[..]] {
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, Path::new(OsStr::from_bytes(raw)), &b"x"[..])
            .unwrap();
    }
    builder.finish().unwrap();

    let tree = ArchiveTree::open(&archive, cache(&temp_dir), Arc::new(Sha256Hasher)).unwrap();
    let mut visited = 0;
    let err = visit_all(&tree, LinksStrategy::None, |_| {
        visited += 1;
        Ok(())
    })
    .unwrap_err();

    assert_eq!(visited, 0);
    assert_eq!(err.kind(), ErrorKind::Expansion);
    assert_eq!(err.root_cause().kind(), ErrorKind::PathSafety);
}

/// Rewrite every central directory record as if the archive was made on MS-DOS.
fn mark_as_dos_archive(path: &Path) {
    let mut bytes = fs::read(path).unwrap();
    let mut offset = 0;
    while let Some(found) = bytes[offset..]
        .windows(4)
        .position(|window| window == b"PK\x01\x02")
    {
        let record = offset + found;
        let name_len = u16::from_le_bytes([bytes[record + 28], bytes[record + 29]]) as usize;
        let is_dir = bytes[record + 46 + name_len - 1] == b'/';
        // version made by: host system 0 is MS-DOS
        bytes[record + 5] = 0;
        let attributes: u32 = if is_dir { 0x10 } else { 0x20 };
        bytes[record + 38..record + 42].copy_from_slice(&attributes.to_le_bytes());
        offset = record + 4;
    }
    fs::write(path, bytes).unwrap();
}

#[test]
fn test_entries_without_unix_mode_get_kind_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("dos.zip");
    let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o600);
    zip.add_directory("d/", options).unwrap();
    zip.start_file("d/dos.txt", options).unwrap();
    zip.write_all(b"dos").unwrap();
    zip.finish().unwrap();
    mark_as_dos_archive(&archive);

    let mut modes = Vec::new();
    visit_all(&zip_tree(&temp_dir, &archive), LinksStrategy::None, |element| {
        modes.push((element.path(), element.kind(), element.permissions().mode()));
        Ok(())
    })
    .unwrap();

    assert_eq!(
        modes,
        vec![
            ("d".to_string(), EntryKind::Directory, 0o755),
            ("d/dos.txt".to_string(), EntryKind::File, 0o644),
        ]
    );
}

#[cfg(unix)]
#[test]
fn test_file_follows_current_links_policy() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("links.zip");
    create_zip_with_link(&archive);
    let tree = zip_tree(&temp_dir, &archive);

    let file_of_link = |links: LinksStrategy| {
        let mut found = None;
        visit_all(&tree, links, |element| {
            if element.name() == "link" {
                found = Some(element.file()?);
            }
            Ok(())
        })
        .unwrap();
        found.unwrap()
    };

    let preserved = file_of_link(LinksStrategy::All);
    assert!(fs::symlink_metadata(&preserved).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&preserved).unwrap(), PathBuf::from("real.txt"));

    // A flattened link is a regular file holding the literal target
    let flattened = file_of_link(LinksStrategy::None);
    assert_eq!(flattened, preserved);
    assert!(fs::symlink_metadata(&flattened).unwrap().file_type().is_file());
    assert_eq!(fs::read(&flattened).unwrap(), b"real.txt");

    let preserved_again = file_of_link(LinksStrategy::All);
    assert!(fs::symlink_metadata(&preserved_again).unwrap().file_type().is_symlink());
}

#[test]
fn test_zip_timestamp_is_read_as_utc_millis() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("dated.zip");
    let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
    let modified = zip::DateTime::from_date_and_time(2020, 1, 2, 3, 4, 6).unwrap();
    zip.start_file("dated.txt", SimpleFileOptions::default().last_modified_time(modified))
        .unwrap();
    zip.write_all(b"dated").unwrap();
    zip.finish().unwrap();

    let mut timestamps = Vec::new();
    visit_all(&zip_tree(&temp_dir, &archive), LinksStrategy::None, |element| {
        timestamps.push(element.last_modified());
        Ok(())
    })
    .unwrap();

    assert_eq!(timestamps, vec![1_577_934_246_000]);
}
