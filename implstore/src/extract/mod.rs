// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Format-dispatching archive extraction.
//!
//! Extractors stream an archive into a destination directory while
//! preserving entry mtimes, executable bits and symbolic links (recorded in
//! the `.xbit`/`.symlink` sidecars on platforms that cannot express them
//! natively). A `start_offset` skips leading non-archive bytes, which is how
//! self-extracting installers that embed an archive are handled; a sub
//! directory filter reroots a portion of the archive at the destination.

mod zip;

pub use self::zip::ZipExtractor;

use crate::{errors::ExtractError, task::TaskHandler};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::fs;

/// MIME type of ZIP archives.
pub const MIME_TYPE_ZIP: &str = "application/zip";

/// A local archive file plus the extraction parameters that accompany it.
#[derive(Clone, Copy, Debug)]
pub struct ArchiveSource<'a> {
    /// Path of the archive on disk.
    pub path: &'a Utf8Path,

    /// MIME type selecting the extractor.
    pub mime_type: &'a str,

    /// Leading bytes to skip before archive parsing begins.
    pub start_offset: u64,

    /// If set, only entries under this slash-separated prefix are extracted,
    /// rerooted at the destination.
    pub sub_dir: Option<&'a str>,
}

/// An archive extractor bound to a source stream and destination directory.
///
/// Implementations are created through [`create_extractor`]; the trait is the
/// seam that keeps the store polymorphic over archive kinds.
pub trait Extractor {
    /// Restricts extraction to entries under `sub_dir`, rerooting them at the
    /// destination.
    fn set_sub_dir(&mut self, sub_dir: &str);

    /// Runs the extraction. The source stream is consumed and closed before
    /// this returns, success or failure; cleaning up partial output is the
    /// caller's responsibility.
    fn run(&mut self, handler: &dyn TaskHandler) -> Result<(), ExtractError>;
}

/// Creates the extractor registered for `mime_type`.
pub fn create_extractor(
    mime_type: &str,
    source: fs::File,
    start_offset: u64,
    destination: &Utf8Path,
) -> Result<Box<dyn Extractor>, ExtractError> {
    match mime_type {
        MIME_TYPE_ZIP => Ok(Box::new(ZipExtractor::new(
            source,
            start_offset,
            destination.to_owned(),
        ))),
        other => Err(ExtractError::UnsupportedArchiveType {
            mime_type: other.to_owned(),
        }),
    }
}

/// Validates an archive entry path: relative, forward slashes, no `.`/`..`
/// components. Returns the path ready to join onto the destination.
pub(crate) fn validate_entry_path(raw: &str) -> Result<Utf8PathBuf, ExtractError> {
    let path = Utf8Path::new(raw.trim_end_matches('/'));
    for component in path.components() {
        match component {
            Utf8Component::Normal(_) => {}
            _ => {
                return Err(ExtractError::UnsafeEntryPath {
                    path: raw.to_owned(),
                });
            }
        }
    }
    if path.as_str().is_empty() {
        return Err(ExtractError::UnsafeEntryPath {
            path: raw.to_owned(),
        });
    }
    Ok(path.to_owned())
}

/// Applies a sub-directory filter to a validated entry path.
///
/// Returns the rerooted path, or `None` if the entry falls outside the
/// prefix (including the prefix directory itself, which maps to the
/// destination root).
pub(crate) fn apply_sub_dir<'p>(path: &'p Utf8Path, sub_dir: Option<&str>) -> Option<&'p Utf8Path> {
    match sub_dir {
        None => Some(path),
        Some(prefix) => {
            let prefix = Utf8Path::new(prefix.trim_matches('/'));
            match path.strip_prefix(prefix) {
                Ok(rest) if !rest.as_str().is_empty() => Some(rest),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("plain/file.txt", true)]
    #[test_case("trailing/dir/", true)]
    #[test_case("/etc/passwd", false)]
    #[test_case("../escape", false)]
    #[test_case("a/../../b", false)]
    #[test_case("./a", false)]
    #[test_case("a/./b", true ; "interior dot components are normalized away")]
    #[test_case("", false)]
    fn entry_path_validation(raw: &str, ok: bool) {
        assert_eq!(validate_entry_path(raw).is_ok(), ok, "{raw:?}");
    }

    #[test]
    fn sub_dir_reroots_and_filters() {
        let path = Utf8Path::new("sub/dir/file");
        assert_eq!(
            apply_sub_dir(path, Some("sub")),
            Some(Utf8Path::new("dir/file"))
        );
        assert_eq!(
            apply_sub_dir(path, Some("sub/dir")),
            Some(Utf8Path::new("file"))
        );
        // The prefix itself and entries outside it are skipped.
        assert_eq!(apply_sub_dir(Utf8Path::new("sub"), Some("sub")), None);
        assert_eq!(apply_sub_dir(Utf8Path::new("other/file"), Some("sub")), None);
        // No filter passes everything through.
        assert_eq!(apply_sub_dir(path, None), Some(path));
    }

    #[test]
    fn unknown_mime_type_is_rejected() {
        let dir = camino_tempfile::tempdir().unwrap();
        let file_path = dir.path().join("archive.bin");
        std::fs::write(&file_path, b"").unwrap();
        let file = std::fs::File::open(&file_path).unwrap();
        let err = match create_extractor("application/x-lzip", file, 0, dir.path()) {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, ExtractError::UnsupportedArchiveType { .. }));
    }
}
