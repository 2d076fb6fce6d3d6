// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests of the directory store against a real filesystem.

mod common;

use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use filetime::FileTime;
use implstore::{
    errors::{AddError, RemoveError},
    manifest::{MANIFEST_FILE_NAME, Manifest, ManifestDigest, ManifestFormat},
    store::DirectoryStore,
    task::SilentHandler,
};
use pretty_assertions::assert_eq;
use std::fs;

fn write_tree(dir: &Utf8Path, files: &[(&str, &[u8])]) {
    for (rel, contents) in files {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(common::FIXTURE_MTIME, 0))
            .unwrap();
    }
}

fn digest_of_tree(dir: &Utf8Path) -> ManifestDigest {
    let handler = SilentHandler::new();
    let manifest = Manifest::generate(dir, ManifestFormat::Sha256New, &handler).unwrap();
    ManifestDigest::from_id(&manifest.digest_id()).unwrap()
}

fn sample_store() -> (Utf8TempDir, DirectoryStore) {
    let root = Utf8TempDir::new().unwrap();
    let store = DirectoryStore::open(root.path().join("store")).unwrap();
    (root, store)
}

#[test]
fn add_directory_then_look_up() {
    let (_root, store) = sample_store();
    let source = Utf8TempDir::new().unwrap();
    write_tree(
        source.path(),
        &[("file1", b"AAAA"), ("folder1/file2", b"dskf\nsdf\n")],
    );
    let digest = digest_of_tree(source.path());
    let digest_id = digest.best_id().unwrap();
    let handler = SilentHandler::new();

    let installed = store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    assert!(store.contains(&digest));
    assert_eq!(store.path(&digest).unwrap(), installed);
    assert_eq!(
        store.list_all().unwrap().into_iter().collect::<Vec<_>>(),
        vec![digest_id.clone()]
    );

    // The stored manifest reproduces the name the tree is installed under.
    let manifest = Manifest::load(
        &installed.join(MANIFEST_FILE_NAME),
        ManifestFormat::Sha256New,
    )
    .unwrap();
    assert_eq!(manifest.digest_id(), digest_id);
    assert_eq!(common::read_file(&installed.join("file1")), b"AAAA");
}

#[test]
fn adding_twice_reports_already_in_store() {
    let (_root, store) = sample_store();
    let source = Utf8TempDir::new().unwrap();
    write_tree(source.path(), &[("file", b"contents")]);
    let digest = digest_of_tree(source.path());
    let handler = SilentHandler::new();

    store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    let err = store
        .add_directory(source.path(), &digest, &handler)
        .unwrap_err();
    assert!(matches!(err, AddError::AlreadyInStore { .. }));
    // The loser's staging directory is gone; only the install remains.
    assert_eq!(store.list_all().unwrap().len(), 1);
}

#[test]
fn remove_then_add_is_idempotent() {
    let (_root, store) = sample_store();
    let source = Utf8TempDir::new().unwrap();
    write_tree(source.path(), &[("file", b"contents"), ("sub/other", b"x")]);
    let digest = digest_of_tree(source.path());
    let handler = SilentHandler::new();

    store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    store.remove(&digest).unwrap();
    assert!(!store.contains(&digest));
    assert!(store.list_all().unwrap().is_empty());

    let err = store.remove(&digest).unwrap_err();
    assert!(matches!(err, RemoveError::NotFound(_)));

    // Re-adding after removal behaves exactly like the first add.
    store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    assert!(store.contains(&digest));
}

#[cfg(unix)]
#[test]
fn installed_trees_are_write_protected() {
    let (_root, store) = sample_store();
    let source = Utf8TempDir::new().unwrap();
    write_tree(source.path(), &[("file", b"contents")]);
    let digest = digest_of_tree(source.path());
    let handler = SilentHandler::new();

    let installed = store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    assert!(fs::write(installed.join("file"), b"tampered").is_err());
    assert!(fs::write(installed.join("new-file"), b"added").is_err());
}

#[test]
fn verify_passes_on_fresh_store_and_flags_corruption() {
    let (_root, store) = sample_store();
    let source = Utf8TempDir::new().unwrap();
    write_tree(source.path(), &[("file", b"contents")]);
    let digest = digest_of_tree(source.path());
    let handler = SilentHandler::new();

    let installed = store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    let report = store.verify(&handler).unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.issues.is_empty(), "{:?}", report.issues);

    // Corrupt the installed tree behind the store's back.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let file = installed.join("file");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(&file, b"tampered").unwrap();

        let report = store.verify(&handler).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.issues.len(), 1);
    }
}

#[cfg(unix)]
#[test]
fn optimise_hard_links_identical_files() {
    use std::os::unix::fs::MetadataExt;

    let (_root, store) = sample_store();
    let handler = SilentHandler::new();

    let source1 = Utf8TempDir::new().unwrap();
    write_tree(
        source1.path(),
        &[("shared", b"identical bytes"), ("only-in-1", b"one")],
    );
    let source2 = Utf8TempDir::new().unwrap();
    write_tree(
        source2.path(),
        &[("shared", b"identical bytes"), ("only-in-2", b"two")],
    );
    let digest1 = digest_of_tree(source1.path());
    let digest2 = digest_of_tree(source2.path());
    assert_ne!(digest1, digest2);

    store
        .add_directory(source1.path(), &digest1, &handler)
        .unwrap();
    store
        .add_directory(source2.path(), &digest2, &handler)
        .unwrap();

    let report = store.optimise(&handler).unwrap();
    assert_eq!(report.linked_files, 1);
    assert_eq!(report.saved_bytes, b"identical bytes".len() as u64);

    let first = fs::metadata(store.path(&digest1).unwrap().join("shared")).unwrap();
    let second = fs::metadata(store.path(&digest2).unwrap().join("shared")).unwrap();
    assert_eq!(first.ino(), second.ino());

    // Deduplication must not change what verify sees.
    let verify = store.verify(&handler).unwrap();
    assert!(verify.issues.is_empty(), "{:?}", verify.issues);

    // A second pass has nothing left to do.
    let report = store.optimise(&handler).unwrap();
    assert_eq!(report.linked_files, 0);
}

#[test]
fn old_format_digests_install_with_directory_mtimes() {
    let (_root, store) = sample_store();
    let source = Utf8TempDir::new().unwrap();
    write_tree(source.path(), &[("sub/file", b"old family")]);
    filetime::set_file_mtime(
        source.path().join("sub"),
        FileTime::from_unix_time(common::FIXTURE_MTIME, 0),
    )
    .unwrap();
    filetime::set_file_mtime(
        source.path(),
        FileTime::from_unix_time(common::FIXTURE_MTIME, 0),
    )
    .unwrap();
    let handler = SilentHandler::new();

    let manifest =
        Manifest::generate(source.path(), ManifestFormat::Sha256, &handler).unwrap();
    let digest = ManifestDigest::from_id(&manifest.digest_id()).unwrap();

    let installed = store
        .add_directory(source.path(), &digest, &handler)
        .unwrap();
    assert!(store.contains(&digest));
    let stored =
        Manifest::load(&installed.join(MANIFEST_FILE_NAME), ManifestFormat::Sha256).unwrap();
    assert_eq!(stored.digest_id(), digest.best_id().unwrap());
    // Old-family manifests carry directory mtimes on their D lines.
    assert!(stored.serialize().contains(&format!("D {} /sub\n", common::FIXTURE_MTIME)));
}
