// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `.xbit` and `.symlink` sidecar files.
//!
//! Filesystems without Unix permission bits cannot record executability, and
//! filesystems without symbolic links cannot record link-ness. Implementations
//! stored on such platforms carry the information in two sidecar files at the
//! implementation root, each a newline-separated list of slash-rooted paths.
//! On Unix the filesystem metadata is authoritative and the sidecars are
//! neither read nor written.

use camino::Utf8Path;
use std::{
    collections::BTreeSet,
    fs,
    io::{self, Write},
};

/// File name of the executable-bit sidecar.
pub const XBIT_FILE_NAME: &str = ".xbit";

/// File name of the symlink sidecar.
pub const SYMLINK_FILE_NAME: &str = ".symlink";

/// An in-memory view of one sidecar file.
#[derive(Clone, Debug, Default)]
pub(crate) struct Sidecar {
    paths: BTreeSet<String>,
}

impl Sidecar {
    /// Loads `root/<file_name>`, returning an empty sidecar if it is absent.
    pub(crate) fn load(root: &Utf8Path, file_name: &str) -> io::Result<Self> {
        let path = root.join(file_name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
            Err(error) => return Err(error),
        };
        Ok(Self::parse(&text))
    }

    pub(crate) fn parse(text: &str) -> Self {
        let paths = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        Self { paths }
    }

    /// True if the slash-rooted `path` is recorded.
    pub(crate) fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub(crate) fn insert(&mut self, path: String) {
        self.paths.insert(path);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Writes the sidecar to `root/<file_name>`, or removes the file if the
    /// sidecar is empty.
    pub(crate) fn save(&self, root: &Utf8Path, file_name: &str) -> io::Result<()> {
        let path = root.join(file_name);
        if self.paths.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
            return Ok(());
        }
        let mut file = fs::File::create(&path)?;
        for path in &self.paths {
            writeln!(file, "{path}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_blank_lines() {
        let sidecar = Sidecar::parse("/bin/tool\n\n/sub/other\n");
        assert!(sidecar.contains("/bin/tool"));
        assert!(sidecar.contains("/sub/other"));
        assert!(!sidecar.contains("/bin"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut sidecar = Sidecar::default();
        sidecar.insert("/SDL.dll".to_owned());
        sidecar.insert("/sub/run me".to_owned());
        sidecar.save(dir.path(), XBIT_FILE_NAME).unwrap();

        let loaded = Sidecar::load(dir.path(), XBIT_FILE_NAME).unwrap();
        assert!(loaded.contains("/SDL.dll"));
        assert!(loaded.contains("/sub/run me"));

        // An empty sidecar removes the file.
        Sidecar::default().save(dir.path(), XBIT_FILE_NAME).unwrap();
        assert!(!dir.path().join(XBIT_FILE_NAME).exists());
    }
}
