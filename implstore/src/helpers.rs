// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for implstore.

use camino::Utf8Path;
use std::fs;

/// Buffer size used for all chunked reads; cancellation tokens are checked
/// between chunks.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Utilities for pluralizing words in log and progress messages.
pub(crate) mod plural {
    /// Returns "file" if `count` is 1, otherwise "files".
    #[cfg_attr(not(unix), allow(dead_code))]
    pub(crate) fn files_str(count: usize) -> &'static str {
        if count == 1 { "file" } else { "files" }
    }

    /// Returns "implementation" if `count` is 1, otherwise "implementations".
    pub(crate) fn implementations_str(count: usize) -> &'static str {
        if count == 1 {
            "implementation"
        } else {
            "implementations"
        }
    }
}

/// Returns the mtime of `metadata` in whole seconds since the Unix epoch.
///
/// Sub-second precision is deliberately discarded: manifests record whole
/// seconds, and the store requires only 1-second accuracy of the backing
/// filesystem.
pub(crate) fn unix_mtime(metadata: &fs::Metadata) -> i64 {
    filetime::FileTime::from_last_modification_time(metadata).unix_seconds()
}

/// Joins a slash-rooted manifest path and an entry name.
///
/// `"/" + "a"` is `"/a"`; `"/a" + "b"` is `"/a/b"`.
pub(crate) fn join_rooted(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Converts a slash-rooted manifest path into a filesystem path under `root`.
#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) fn rooted_to_fs(root: &Utf8Path, rooted: &str) -> camino::Utf8PathBuf {
    root.join(rooted.trim_start_matches('/'))
}
