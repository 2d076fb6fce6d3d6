// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The content-addressed directory store.
//!
//! Each sub-directory of the store root is named by an implementation digest
//! string and contains exactly the tree that digest describes, plus the
//! `.manifest` file recording its canonical manifest. All mutations go
//! through a staging discipline: work happens in a dot-prefixed temporary
//! directory inside the root, the digest is verified there, and a single
//! `rename` commits the install. Two concurrent installs of the same digest
//! race on that rename; the loser observes [`AddError::AlreadyInStore`] and
//! its staging directory is cleaned up on drop.

mod fs_ops;

use crate::{
    errors::{
        AddError, ImplementationNotFound, RemoveError, StoreOpenError, StoreScanError,
    },
    extract::{ArchiveSource, create_extractor},
    manifest::{MANIFEST_FILE_NAME, Manifest, ManifestDigest},
    task::TaskHandler,
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use fs_ops::{
    StoreAccess, apply_write_protection, lift_write_protection, probe_time_accuracy,
    transient_name,
};
use std::{collections::BTreeSet, fs, io};
use tracing::{debug, info, warn};

/// A content-addressed implementation cache rooted at one directory.
///
/// Lookups ([`contains`](Self::contains), [`path`](Self::path),
/// [`list_all`](Self::list_all)) may run concurrently from any thread;
/// installs serialize per digest through the filesystem rename.
#[derive(Debug)]
pub struct DirectoryStore {
    root: Utf8PathBuf,
    access: StoreAccess,
}

impl DirectoryStore {
    /// Opens (creating if necessary) the store at `root`.
    ///
    /// Probes the backing filesystem for 1-second mtime accuracy; a root
    /// that is not writable yields a read-only store and skips the probe.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreOpenError> {
        let root = root.into();
        if let Err(error) = fs::create_dir_all(&root) {
            if !root.is_dir() {
                return Err(StoreOpenError::Io {
                    store_root: root,
                    error,
                });
            }
        }
        let access = probe_time_accuracy(&root)?;
        debug!("opened store at {root} ({access:?})");
        Ok(Self { root, access })
    }

    /// The store root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// True if the store rejects mutations.
    pub fn is_read_only(&self) -> bool {
        self.access == StoreAccess::ReadOnly
    }

    /// True iff some algorithm of `digest` names an installed implementation.
    pub fn contains(&self, digest: &ManifestDigest) -> bool {
        digest.ids().any(|id| self.root.join(id).is_dir())
    }

    /// Returns the installed directory for `digest`.
    pub fn path(&self, digest: &ManifestDigest) -> Result<Utf8PathBuf, ImplementationNotFound> {
        digest
            .ids()
            .map(|id| self.root.join(id))
            .find(|path| path.is_dir())
            .ok_or_else(|| ImplementationNotFound {
                digest: digest
                    .best_id()
                    .unwrap_or_else(|| "(no digest)".to_owned()),
            })
    }

    /// Enumerates installed digest strings, byte-wise sorted.
    ///
    /// Only names of the `<algorithm>=<value>` form count; dot-prefixed
    /// entries (staging, removal leftovers) are skipped.
    pub fn list_all(&self) -> Result<BTreeSet<String>, StoreScanError> {
        let scan_err = |error: io::Error| StoreScanError::Io {
            store_root: self.root.clone(),
            error,
        };
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.root).map_err(scan_err)? {
            let entry = entry.map_err(scan_err)?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !name.contains('=') {
                continue;
            }
            if entry.file_type().map_err(scan_err)?.is_dir() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Copies the tree at `source` into the store under `expected`.
    pub fn add_directory(
        &self,
        source: &Utf8Path,
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<Utf8PathBuf, AddError> {
        let staging = self.new_staging()?;
        fs_ops::copy_tree(source, staging.path())?;
        self.verify_and_install(staging, expected, handler)
    }

    /// Extracts one archive into the store under `expected`.
    pub fn add_archive(
        &self,
        archive: &ArchiveSource<'_>,
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<Utf8PathBuf, AddError> {
        self.add_multiple_archives(std::slice::from_ref(archive), expected, handler)
    }

    /// Extracts several archives in order over one staging directory and
    /// installs the overlaid result under `expected`.
    ///
    /// Later archives may create, overwrite, or add files beside entries from
    /// earlier ones.
    pub fn add_multiple_archives(
        &self,
        archives: &[ArchiveSource<'_>],
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<Utf8PathBuf, AddError> {
        let staging = self.new_staging()?;
        for archive in archives {
            let file = fs::File::open(archive.path).map_err(|error| AddError::Io {
                path: archive.path.to_owned(),
                error,
            })?;
            let mut extractor = create_extractor(
                archive.mime_type,
                file,
                archive.start_offset,
                staging.path(),
            )?;
            if let Some(sub_dir) = archive.sub_dir {
                extractor.set_sub_dir(sub_dir);
            }
            extractor.run(handler)?;
        }
        self.verify_and_install(staging, expected, handler)
    }

    /// Removes an installed implementation.
    ///
    /// The tree is renamed to a transient dot-prefixed name (that rename is
    /// the atomic commit of the removal) and then deleted.
    pub fn remove(&self, digest: &ManifestDigest) -> Result<(), RemoveError> {
        let path = self.path(digest)?;
        lift_write_protection(&path).map_err(|error| RemoveError::Io {
            path: path.clone(),
            error,
        })?;

        let doomed = self.root.join(transient_name(".removing-"));
        fs::rename(&path, &doomed).map_err(|error| RemoveError::Io {
            path: path.clone(),
            error,
        })?;
        fs::remove_dir_all(&doomed).map_err(|error| RemoveError::Io {
            path: doomed.clone(),
            error,
        })?;
        info!("removed {path} from store");
        Ok(())
    }

    /// Recomputes every installed implementation's manifest and compares it
    /// with the name it is stored under.
    pub fn verify(&self, handler: &dyn TaskHandler) -> Result<VerifyReport, StoreScanError> {
        let mut report = VerifyReport::default();
        for name in self.list_all()? {
            report.checked += 1;
            let Some((format, _)) = ManifestDigest::parse_id(&name) else {
                report.issues.push(VerifyIssue {
                    name,
                    kind: VerifyIssueKind::UnknownAlgorithm,
                });
                continue;
            };
            match Manifest::generate(&self.root.join(&name), format, handler) {
                Ok(manifest) => {
                    let actual = manifest.digest_id();
                    if actual != name {
                        report.issues.push(VerifyIssue {
                            name,
                            kind: VerifyIssueKind::DigestMismatch { actual },
                        });
                    }
                }
                Err(error) => {
                    report.issues.push(VerifyIssue {
                        name,
                        kind: VerifyIssueKind::Error {
                            message: error.to_string(),
                        },
                    });
                }
            }
        }
        Ok(report)
    }

    /// Deduplicates identical files across implementations via hard links.
    ///
    /// Two files are identical when their manifest records agree on content
    /// digest, size, mtime and executable bit. Platforms without hard links
    /// return an empty report; that is a conforming no-op.
    pub fn optimise(&self, handler: &dyn TaskHandler) -> Result<OptimiseReport, StoreScanError> {
        optimise_impl(self, handler)
    }

    fn new_staging(&self) -> Result<Utf8TempDir, AddError> {
        camino_tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(|error| AddError::Io {
                path: self.root.clone(),
                error,
            })
    }

    /// The verify-and-install protocol. Consumes the staging directory: on
    /// any failure it is deleted when dropped; on success its contents have
    /// been renamed into place.
    fn verify_and_install(
        &self,
        staging: Utf8TempDir,
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<Utf8PathBuf, AddError> {
        let (format, value) = expected.best().ok_or(AddError::NoKnownDigest)?;
        let expected_id = format!("{}={value}", format.prefix());

        let manifest = Manifest::generate(staging.path(), format, handler)?;

        // Writing .manifest bumps the root directory's mtime, which sits on
        // the old-family root line; put it back so re-verification of the
        // installed tree reproduces the digest.
        let root_mtime = fs::metadata(staging.path())
            .map(|meta| filetime::FileTime::from_last_modification_time(&meta))
            .map_err(|error| AddError::Io {
                path: staging.path().to_owned(),
                error,
            })?;
        let manifest_path = staging.path().join(MANIFEST_FILE_NAME);
        manifest.save(&manifest_path).map_err(|error| AddError::Io {
            path: manifest_path,
            error,
        })?;
        filetime::set_file_mtime(staging.path(), root_mtime).map_err(|error| AddError::Io {
            path: staging.path().to_owned(),
            error,
        })?;

        let actual_id = manifest.digest_id();
        if actual_id != expected_id {
            return Err(AddError::DigestMismatch {
                expected: expected_id,
                actual: actual_id,
                manifest: manifest.serialize(),
            });
        }

        let target = self.root.join(&expected_id);
        if target.exists() {
            return Err(AddError::AlreadyInStore {
                digest: expected_id,
            });
        }
        match fs::rename(staging.path(), &target) {
            Ok(()) => {}
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                // Lost the install race; the winner's tree is the same bytes.
                return Err(AddError::AlreadyInStore {
                    digest: expected_id,
                });
            }
            Err(error) => {
                return Err(AddError::Io {
                    path: target,
                    error,
                });
            }
        }
        let _ = staging.keep();

        info!("installed {expected_id}");
        if let Err(error) = apply_write_protection(&target) {
            warn!("failed to write-protect {target}: {error}");
        }
        Ok(target)
    }
}

/// Result of [`DirectoryStore::verify`].
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// How many implementations were checked.
    pub checked: usize,
    /// Implementations whose contents do not match their name.
    pub issues: Vec<VerifyIssue>,
}

/// One problem found by [`DirectoryStore::verify`].
#[derive(Debug)]
pub struct VerifyIssue {
    /// The store entry's name.
    pub name: String,
    /// What is wrong with it.
    pub kind: VerifyIssueKind,
}

/// The kinds of problem [`DirectoryStore::verify`] reports.
#[derive(Debug)]
pub enum VerifyIssueKind {
    /// The name's algorithm prefix is not recognized.
    UnknownAlgorithm,
    /// The recomputed digest differs from the name.
    DigestMismatch {
        /// The digest the contents actually hash to.
        actual: String,
    },
    /// The tree could not be read or hashed.
    Error {
        /// Rendered error message.
        message: String,
    },
}

/// Result of [`DirectoryStore::optimise`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OptimiseReport {
    /// Bytes reclaimed by replacing duplicates with hard links.
    pub saved_bytes: u64,
    /// Number of files that were replaced with links.
    pub linked_files: usize,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn optimise_impl(
            store: &DirectoryStore,
            handler: &dyn TaskHandler,
        ) -> Result<OptimiseReport, StoreScanError> {
            use crate::{helpers::rooted_to_fs, manifest::ManifestNode, task::TaskInfo};
            use std::collections::HashMap;

            handler.run_task(&TaskInfo::new(store.root().as_str()), "optimising store");

            // (content digest, mtime, size, executable) -> canonical path.
            type Key = (String, i64, u64, bool);
            let mut canonical: HashMap<Key, Utf8PathBuf> = HashMap::new();
            // Duplicates grouped per implementation so protection is lifted
            // once per tree.
            let mut planned: Vec<(Utf8PathBuf, Vec<(Utf8PathBuf, Utf8PathBuf, u64)>)> = Vec::new();

            for name in store.list_all()? {
                let Some((format, _)) = ManifestDigest::parse_id(&name) else {
                    continue;
                };
                let impl_root = store.root().join(&name);
                let manifest = match Manifest::load(&impl_root.join(MANIFEST_FILE_NAME), format) {
                    Ok(manifest) => manifest,
                    Err(error) => {
                        warn!("skipping {name} during optimise: {error}");
                        continue;
                    }
                };

                let mut links = Vec::new();
                let mut current_dir = "/".to_owned();
                for node in manifest.nodes() {
                    let (digest, mtime, size, name, executable) = match node {
                        ManifestNode::Dir { path, .. } => {
                            current_dir = path.clone();
                            continue;
                        }
                        ManifestNode::Symlink { .. } => continue,
                        ManifestNode::File {
                            digest,
                            mtime,
                            size,
                            name,
                        } => (digest, *mtime, *size, name, false),
                        ManifestNode::Executable {
                            digest,
                            mtime,
                            size,
                            name,
                        } => (digest, *mtime, *size, name, true),
                    };
                    if size == 0 {
                        continue;
                    }
                    let rooted = crate::helpers::join_rooted(&current_dir, name);
                    let file_path = rooted_to_fs(&impl_root, &rooted);
                    let key = (digest.clone(), mtime, size, executable);
                    match canonical.get(&key) {
                        None => {
                            canonical.insert(key, file_path);
                        }
                        Some(existing) => {
                            if !already_linked(existing, &file_path) {
                                links.push((file_path, existing.clone(), size));
                            }
                        }
                    }
                }
                if !links.is_empty() {
                    planned.push((impl_root, links));
                }
            }

            let mut report = OptimiseReport::default();
            for (impl_root, links) in planned {
                if let Err(error) = lift_write_protection(&impl_root) {
                    warn!("skipping {impl_root} during optimise: {error}");
                    continue;
                }
                for (dup, canonical, size) in links {
                    match link_over(&canonical, &dup) {
                        Ok(()) => {
                            report.saved_bytes += size;
                            report.linked_files += 1;
                        }
                        Err(error) => warn!("failed to link {dup}: {error}"),
                    }
                }
                if let Err(error) = apply_write_protection(&impl_root) {
                    warn!("failed to re-protect {impl_root}: {error}");
                }
            }
            if report.linked_files > 0 {
                info!(
                    "optimise reclaimed {} bytes across {} {}",
                    report.saved_bytes,
                    report.linked_files,
                    crate::helpers::plural::files_str(report.linked_files),
                );
            }
            Ok(report)
        }

        fn already_linked(a: &Utf8Path, b: &Utf8Path) -> bool {
            use std::os::unix::fs::MetadataExt;
            match (fs::metadata(a), fs::metadata(b)) {
                (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
                _ => false,
            }
        }

        /// Replaces `dup` with a hard link to `canonical`, going through a
        /// transient name in the same directory so the replacement is atomic.
        fn link_over(canonical: &Utf8Path, dup: &Utf8Path) -> io::Result<()> {
            let parent = dup
                .parent()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent"))?;
            let tmp = parent.join(transient_name(".opt-"));
            fs::hard_link(canonical, &tmp)?;
            match fs::rename(&tmp, dup) {
                Ok(()) => Ok(()),
                Err(error) => {
                    let _ = fs::remove_file(&tmp);
                    Err(error)
                }
            }
        }
    } else {
        fn optimise_impl(
            _store: &DirectoryStore,
            _handler: &dyn TaskHandler,
        ) -> Result<OptimiseReport, StoreScanError> {
            Ok(OptimiseReport::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SilentHandler;

    #[test]
    fn list_all_filters_names() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        fs::create_dir(dir.path().join("sha256new=abc")).unwrap();
        fs::create_dir(dir.path().join(".staging-xyz")).unwrap();
        fs::create_dir(dir.path().join("not-a-digest")).unwrap();
        fs::write(dir.path().join("sha1=file-not-dir"), b"").unwrap();

        let names = store.list_all().unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["sha256new=abc".to_owned()]
        );
    }

    #[test]
    fn digest_mismatch_cleans_staging() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let source = camino_tempfile::tempdir().unwrap();
        fs::write(source.path().join("file"), b"contents").unwrap();

        let expected = ManifestDigest::from_id("sha256new=nonsense").unwrap();
        let handler = SilentHandler::new();
        let err = store
            .add_directory(source.path(), &expected, &handler)
            .unwrap_err();
        assert!(matches!(err, AddError::DigestMismatch { .. }));

        // No staging leftovers, nothing installed.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!store.contains(&expected));
    }

    #[test]
    fn empty_digest_is_rejected() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let source = camino_tempfile::tempdir().unwrap();
        let handler = SilentHandler::new();
        let err = store
            .add_directory(source.path(), &ManifestDigest::new(), &handler)
            .unwrap_err();
        assert!(matches!(err, AddError::NoKnownDigest));
    }
}
