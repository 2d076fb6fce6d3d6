// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical manifests of directory trees.
//!
//! A manifest is a line-oriented, LF-terminated serialization of a tree in
//! which every node appears in a deterministic order: depth-first, entries at
//! each level sorted by name byte-wise, every directory (the root included)
//! emitting its own `D` line when visited. Hashing the manifest bytes yields
//! the implementation's digest, so the ordering and the exact field layout
//! are part of the wire contract.
//!
//! Four formats exist; see [`ManifestFormat`] for the differences between the
//! old (`sha1`/`sha256`) and new (`sha1new`/`sha256new`) families.

mod digest;

pub use digest::*;

use crate::{
    errors::{
        MalformedManifest, MalformedManifestKind, ManifestGenError, ManifestLoadError,
    },
    helpers::{CHUNK_SIZE, join_rooted, unix_mtime},
    sidecar::{SYMLINK_FILE_NAME, Sidecar, XBIT_FILE_NAME},
    task::{TaskHandler, TaskInfo},
};
use camino::Utf8Path;
use std::{
    fmt::Write as _,
    fs,
    io::{self, Read},
};

/// The name under which a manifest is persisted inside an installed
/// implementation. Excluded from traversal at the root level.
pub const MANIFEST_FILE_NAME: &str = ".manifest";

/// One line of a manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestNode {
    /// A regular file: `F <hash> <mtime> <size> <name>`.
    File {
        /// Lowercase hex hash of the file contents.
        digest: String,
        /// Modification time in whole seconds since the epoch.
        mtime: i64,
        /// Size in bytes.
        size: u64,
        /// The file name. Never contains `/` or a newline.
        name: String,
    },

    /// An executable file: `X <hash> <mtime> <size> <name>`.
    Executable {
        /// Lowercase hex hash of the file contents.
        digest: String,
        /// Modification time in whole seconds since the epoch.
        mtime: i64,
        /// Size in bytes.
        size: u64,
        /// The file name. Never contains `/` or a newline.
        name: String,
    },

    /// A symbolic link: `S <hash> <size> <name>`.
    ///
    /// The hash is over exactly the UTF-8 bytes of the target string, no
    /// terminator; symlink mtimes are not observable portably and are
    /// omitted.
    Symlink {
        /// Lowercase hex hash of the target bytes.
        digest: String,
        /// Length of the target in bytes.
        size: u64,
        /// The link name. Never contains `/` or a newline.
        name: String,
    },

    /// A directory: `D <full-path>` (new family) or `D <mtime> <full-path>`
    /// (old family).
    Dir {
        /// Modification time; present exactly in the old family.
        mtime: Option<i64>,
        /// Slash-rooted path relative to the implementation root; `/` for
        /// the root itself.
        path: String,
    },
}

impl ManifestNode {
    fn write_line(&self, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = match self {
            Self::File {
                digest,
                mtime,
                size,
                name,
            } => writeln!(out, "F {digest} {mtime} {size} {name}"),
            Self::Executable {
                digest,
                mtime,
                size,
                name,
            } => writeln!(out, "X {digest} {mtime} {size} {name}"),
            Self::Symlink { digest, size, name } => writeln!(out, "S {digest} {size} {name}"),
            Self::Dir {
                mtime: Some(mtime),
                path,
            } => writeln!(out, "D {mtime} {path}"),
            Self::Dir { mtime: None, path } => writeln!(out, "D {path}"),
        };
    }
}

/// A canonical manifest: an ordered node list plus the format it was
/// generated under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    format: ManifestFormat,
    nodes: Vec<ManifestNode>,
}

impl Manifest {
    /// Generates the manifest of the tree rooted at `root`.
    ///
    /// Identical trees produce bit-identical manifests. The top-level
    /// `.manifest`, `.xbit` and `.symlink` entries are store metadata and are
    /// excluded, so re-generating an installed implementation reproduces the
    /// digest it is stored under.
    pub fn generate(
        root: &Utf8Path,
        format: ManifestFormat,
        handler: &dyn TaskHandler,
    ) -> Result<Self, ManifestGenError> {
        handler.starting_manifest(&TaskInfo::new(root.as_str()));

        let ctx = WalkContext::load(root, handler)?;
        let mut nodes = Vec::new();
        walk_dir(root, "/", format, &ctx, &mut nodes)?;
        Ok(Self { format, nodes })
    }

    /// Constructs a manifest from parts. The caller is responsible for
    /// ordering; prefer [`generate`](Self::generate).
    pub fn from_nodes(format: ManifestFormat, nodes: Vec<ManifestNode>) -> Self {
        Self { format, nodes }
    }

    /// The format this manifest was generated or parsed under.
    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// The nodes in manifest order.
    pub fn nodes(&self) -> &[ManifestNode] {
        &self.nodes
    }

    /// Serializes to the canonical line-oriented text.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            node.write_line(&mut out);
        }
        out
    }

    /// The digest string `<prefix>=<encoded>` of the serialized bytes.
    pub fn digest_id(&self) -> String {
        let mut hasher = self.format.new_hasher();
        hasher.update(self.serialize().as_bytes());
        format!(
            "{}={}",
            self.format.prefix(),
            self.format.encode_digest(&hasher.finish())
        )
    }

    /// Parses manifest text generated under `format`.
    pub fn parse(format: ManifestFormat, text: &str) -> Result<Self, MalformedManifest> {
        let mut nodes = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            nodes.push(parse_line(format, line).map_err(|kind| MalformedManifest {
                line: line_no,
                kind,
            })?);
        }
        Ok(Self { format, nodes })
    }

    /// Writes the serialized manifest to `path`.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        fs::write(path, self.serialize())
    }

    /// Loads and parses a manifest file generated under `format`.
    pub fn load(path: &Utf8Path, format: ManifestFormat) -> Result<Self, ManifestLoadError> {
        let text = fs::read_to_string(path).map_err(|error| ManifestLoadError::Io {
            path: path.to_owned(),
            error,
        })?;
        Ok(Self::parse(format, &text)?)
    }
}

fn parse_line(
    format: ManifestFormat,
    line: &str,
) -> Result<ManifestNode, MalformedManifestKind> {
    let mut chars = line.chars();
    let leader = chars.next().ok_or(MalformedManifestKind::EmptyLine)?;
    if !matches!(leader, 'F' | 'X' | 'S' | 'D') {
        return Err(MalformedManifestKind::UnknownLeader { leader });
    }
    if chars.next() != Some(' ') {
        return Err(MalformedManifestKind::WrongFieldCount { leader });
    }
    let rest = &line[2..];

    match leader {
        'F' | 'X' => {
            let mut parts = rest.splitn(4, ' ');
            let (digest, mtime, size, name) = match (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) {
                (Some(digest), Some(mtime), Some(size), Some(name)) if !name.is_empty() => {
                    (digest, mtime, size, name)
                }
                _ => return Err(MalformedManifestKind::WrongFieldCount { leader }),
            };
            let mtime = parse_number::<i64>("mtime", mtime)?;
            let size = parse_number::<u64>("size", size)?;
            let (digest, name) = (digest.to_owned(), name.to_owned());
            Ok(if leader == 'F' {
                ManifestNode::File {
                    digest,
                    mtime,
                    size,
                    name,
                }
            } else {
                ManifestNode::Executable {
                    digest,
                    mtime,
                    size,
                    name,
                }
            })
        }
        'S' => {
            let mut parts = rest.splitn(3, ' ');
            let (digest, size, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(digest), Some(size), Some(name)) if !name.is_empty() => {
                    (digest, size, name)
                }
                _ => return Err(MalformedManifestKind::WrongFieldCount { leader }),
            };
            Ok(ManifestNode::Symlink {
                digest: digest.to_owned(),
                size: parse_number::<u64>("size", size)?,
                name: name.to_owned(),
            })
        }
        'D' => {
            let (mtime, path) = if format.dir_lines_include_mtime() {
                let (mtime, path) = rest
                    .split_once(' ')
                    .ok_or(MalformedManifestKind::WrongFieldCount { leader })?;
                (Some(parse_number::<i64>("mtime", mtime)?), path)
            } else {
                (None, rest)
            };
            if !path.starts_with('/') {
                return Err(MalformedManifestKind::UnrootedPath {
                    path: path.to_owned(),
                });
            }
            Ok(ManifestNode::Dir {
                mtime,
                path: path.to_owned(),
            })
        }
        _ => unreachable!("leader validated above"),
    }
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, MalformedManifestKind> {
    value
        .parse()
        .map_err(|_| MalformedManifestKind::InvalidNumber {
            field,
            value: value.to_owned(),
        })
}

struct WalkContext<'a> {
    handler: &'a dyn TaskHandler,
    root_name: &'a str,
    /// Cumulative bytes hashed, reported through the handler.
    hashed: std::cell::Cell<u64>,
    #[cfg_attr(unix, expect(dead_code))]
    xbit: Sidecar,
    #[cfg_attr(unix, expect(dead_code))]
    symlinks: Sidecar,
}

impl<'a> WalkContext<'a> {
    fn load(root: &'a Utf8Path, handler: &'a dyn TaskHandler) -> Result<Self, ManifestGenError> {
        // On Unix the filesystem metadata is authoritative; the sidecars are
        // only consulted on platforms without Unix permissions.
        let (xbit, symlinks) = if cfg!(unix) {
            (Sidecar::default(), Sidecar::default())
        } else {
            (
                Sidecar::load(root, XBIT_FILE_NAME).map_err(|error| ManifestGenError::Io {
                    path: root.join(XBIT_FILE_NAME),
                    error,
                })?,
                Sidecar::load(root, SYMLINK_FILE_NAME).map_err(|error| ManifestGenError::Io {
                    path: root.join(SYMLINK_FILE_NAME),
                    error,
                })?,
            )
        };
        Ok(Self {
            handler,
            root_name: root.as_str(),
            hashed: std::cell::Cell::new(0),
            xbit,
            symlinks,
        })
    }

    fn cancelled(&self) -> bool {
        self.handler.cancel_token().is_cancelled()
    }
}

fn walk_dir(
    dir: &Utf8Path,
    rooted: &str,
    format: ManifestFormat,
    ctx: &WalkContext<'_>,
    nodes: &mut Vec<ManifestNode>,
) -> Result<(), ManifestGenError> {
    if ctx.cancelled() {
        return Err(ManifestGenError::Cancelled);
    }

    let mtime = if format.dir_lines_include_mtime() {
        let meta = fs::metadata(dir).map_err(|error| ManifestGenError::Io {
            path: dir.to_owned(),
            error,
        })?;
        Some(unix_mtime(&meta))
    } else {
        None
    };
    nodes.push(ManifestNode::Dir {
        mtime,
        path: rooted.to_owned(),
    });

    let mut names = Vec::new();
    let entries = fs::read_dir(dir).map_err(|error| ManifestGenError::Io {
        path: dir.to_owned(),
        error,
    })?;
    for entry in entries {
        let entry = entry.map_err(|error| ManifestGenError::Io {
            path: dir.to_owned(),
            error,
        })?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| ManifestGenError::NonUtf8Name {
                path: dir.join(name.to_string_lossy().as_ref()).into_string(),
            })?;
        names.push(name);
    }
    // Byte-wise (C locale) ordering is part of the wire contract.
    names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    let at_root = rooted == "/";
    for name in names {
        if at_root
            && matches!(
                name.as_str(),
                MANIFEST_FILE_NAME | XBIT_FILE_NAME | SYMLINK_FILE_NAME
            )
        {
            continue;
        }
        if name.contains('\n') {
            return Err(ManifestGenError::NewlineInName {
                name: name.escape_default().to_string(),
            });
        }

        let path = dir.join(&name);
        let child_rooted = join_rooted(rooted, &name);
        let meta = fs::symlink_metadata(&path).map_err(|error| ManifestGenError::Io {
            path: path.clone(),
            error,
        })?;

        if is_symlink(&meta, &child_rooted, ctx) {
            let target = read_symlink_target(&path)?;
            nodes.push(ManifestNode::Symlink {
                digest: format.hash_to_hex(&target),
                size: target.len() as u64,
                name,
            });
        } else if meta.is_dir() {
            walk_dir(&path, &child_rooted, format, ctx, nodes)?;
        } else {
            let digest = hash_file(&path, format, ctx)?;
            let mtime = unix_mtime(&meta);
            let size = meta.len();
            if is_executable(&meta, &child_rooted, ctx) {
                nodes.push(ManifestNode::Executable {
                    digest,
                    mtime,
                    size,
                    name,
                });
            } else {
                nodes.push(ManifestNode::File {
                    digest,
                    mtime,
                    size,
                    name,
                });
            }
        }
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn is_symlink(meta: &fs::Metadata, _rooted: &str, _ctx: &WalkContext<'_>) -> bool {
            meta.file_type().is_symlink()
        }

        fn is_executable(meta: &fs::Metadata, _rooted: &str, _ctx: &WalkContext<'_>) -> bool {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o100 != 0
        }

        fn read_symlink_target(path: &Utf8Path) -> Result<Vec<u8>, ManifestGenError> {
            let target = fs::read_link(path).map_err(|error| ManifestGenError::Io {
                path: path.to_owned(),
                error,
            })?;
            match target.to_str() {
                Some(target) => Ok(target.as_bytes().to_vec()),
                None => Err(ManifestGenError::NonUtf8Name {
                    path: target.to_string_lossy().into_owned(),
                }),
            }
        }
    } else {
        fn is_symlink(_meta: &fs::Metadata, rooted: &str, ctx: &WalkContext<'_>) -> bool {
            ctx.symlinks.contains(rooted)
        }

        fn is_executable(_meta: &fs::Metadata, rooted: &str, ctx: &WalkContext<'_>) -> bool {
            ctx.xbit.contains(rooted)
        }

        fn read_symlink_target(path: &Utf8Path) -> Result<Vec<u8>, ManifestGenError> {
            // Without native symlinks the file's contents are the target.
            fs::read(path).map_err(|error| ManifestGenError::Io {
                path: path.to_owned(),
                error,
            })
        }
    }
}

fn hash_file(
    path: &Utf8Path,
    format: ManifestFormat,
    ctx: &WalkContext<'_>,
) -> Result<String, ManifestGenError> {
    let io_err = |error| ManifestGenError::Io {
        path: path.to_owned(),
        error,
    };
    let mut file = fs::File::open(path).map_err(io_err)?;
    let mut hasher = format.new_hasher();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if ctx.cancelled() {
            return Err(ManifestGenError::Cancelled);
        }
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        ctx.hashed.set(ctx.hashed.get() + n as u64);
        ctx.handler
            .progress(&TaskInfo::new(ctx.root_name), ctx.hashed.get());
    }
    Ok(hex::encode(hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SilentHandler;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn write_tree(dir: &Utf8Path, files: &[(&str, &[u8])]) {
        for (rel, contents) in files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, contents).unwrap();
        }
    }

    #[test]
    fn empty_tree_is_a_single_root_line() {
        let dir = Utf8TempDir::new().unwrap();
        let handler = SilentHandler::new();
        let manifest =
            Manifest::generate(dir.path(), ManifestFormat::Sha256New, &handler).unwrap();
        assert_eq!(manifest.serialize(), "D /\n");
    }

    #[test]
    fn zero_byte_file_hashes_empty_input() {
        let dir = Utf8TempDir::new().unwrap();
        write_tree(dir.path(), &[("empty", b"")]);
        let handler = SilentHandler::new();
        let manifest =
            Manifest::generate(dir.path(), ManifestFormat::Sha256New, &handler).unwrap();
        match &manifest.nodes()[1] {
            ManifestNode::File { digest, size, .. } => {
                assert_eq!(*size, 0);
                assert_eq!(digest, &ManifestFormat::Sha256New.hash_to_hex(b""));
            }
            other => panic!("expected file node, got {other:?}"),
        }
    }

    #[test]
    fn traversal_order_is_sorted_and_depth_first() {
        let dir = Utf8TempDir::new().unwrap();
        write_tree(
            dir.path(),
            &[
                ("zz", b"z"),
                ("aa/inner", b"i"),
                ("mm", b"m"),
            ],
        );
        let handler = SilentHandler::new();
        let manifest =
            Manifest::generate(dir.path(), ManifestFormat::Sha256New, &handler).unwrap();
        let shape: Vec<String> = manifest
            .nodes()
            .iter()
            .map(|node| match node {
                ManifestNode::Dir { path, .. } => format!("D {path}"),
                ManifestNode::File { name, .. } => format!("F {name}"),
                ManifestNode::Executable { name, .. } => format!("X {name}"),
                ManifestNode::Symlink { name, .. } => format!("S {name}"),
            })
            .collect();
        assert_eq!(shape, ["D /", "D /aa", "F inner", "F mm", "F zz"]);
    }

    #[test]
    fn root_metadata_files_are_excluded() {
        let dir = Utf8TempDir::new().unwrap();
        write_tree(
            dir.path(),
            &[
                (".manifest", b"old"),
                (".xbit", b"/a"),
                (".symlink", b"/b"),
                ("sub/.manifest", b"kept"),
                ("file", b"f"),
            ],
        );
        let handler = SilentHandler::new();
        let manifest =
            Manifest::generate(dir.path(), ManifestFormat::Sha256New, &handler).unwrap();
        let names: Vec<&str> = manifest
            .nodes()
            .iter()
            .filter_map(|node| match node {
                ManifestNode::File { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        // Only excluded at the root; a nested .manifest is ordinary content.
        assert_eq!(names, [".manifest", "file"]);
    }

    #[cfg(unix)]
    #[test]
    fn executable_and_symlink_nodes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = Utf8TempDir::new().unwrap();
        write_tree(dir.path(), &[("README-SDL.txt", b"docs"), ("SDL.dll", b"\x7fELF")]);
        let exe = dir.path().join("SDL.dll");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("README-SDL.txt", dir.path().join("link")).unwrap();

        let handler = SilentHandler::new();
        let manifest =
            Manifest::generate(dir.path(), ManifestFormat::Sha256New, &handler).unwrap();
        let text = manifest.serialize();
        assert!(text.contains("\nF "), "regular file line in {text}");
        assert!(text.contains("\nX "), "executable line in {text}");
        let expected_link = format!(
            "S {} {} link\n",
            ManifestFormat::Sha256New.hash_to_hex(b"README-SDL.txt"),
            "README-SDL.txt".len()
        );
        assert!(text.contains(&expected_link), "symlink line in {text}");
    }

    #[test_case(ManifestFormat::Sha1)]
    #[test_case(ManifestFormat::Sha1New)]
    #[test_case(ManifestFormat::Sha256)]
    #[test_case(ManifestFormat::Sha256New)]
    fn parse_serialize_round_trip(format: ManifestFormat) {
        let dir = Utf8TempDir::new().unwrap();
        write_tree(
            dir.path(),
            &[
                ("file1", b"AAAA"),
                ("folder1/file2", b"dskf\nsdf\n"),
                ("name with spaces", b"x"),
            ],
        );
        let handler = SilentHandler::new();
        let manifest = Manifest::generate(dir.path(), format, &handler).unwrap();
        let text = manifest.serialize();
        let parsed = Manifest::parse(format, &text).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.serialize(), text);
        assert_eq!(parsed.digest_id(), manifest.digest_id());
    }

    #[test]
    fn digest_id_has_format_prefix() {
        let manifest = Manifest::from_nodes(
            ManifestFormat::Sha256New,
            vec![ManifestNode::Dir {
                mtime: None,
                path: "/".to_owned(),
            }],
        );
        let id = manifest.digest_id();
        assert!(id.starts_with("sha256new="), "{id}");
        let (format, value) = ManifestDigest::parse_id(&id).unwrap();
        assert_eq!(format, ManifestFormat::Sha256New);
        // 32 hash bytes, base32: ceil(256 / 5) characters, all lowercase.
        assert_eq!(value.len(), 52);
        assert!(value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn old_format_dir_lines_carry_mtime() {
        let text = indoc! {"
            D 1577836800 /
            F 0123abcd 1577836800 4 file1
        "};
        let manifest = Manifest::parse(ManifestFormat::Sha256, text).unwrap();
        assert_eq!(
            manifest.nodes()[0],
            ManifestNode::Dir {
                mtime: Some(1577836800),
                path: "/".to_owned(),
            }
        );
        assert_eq!(manifest.serialize(), text);
    }

    #[test]
    fn name_with_spaces_survives_parsing() {
        let line = "F abcd 100 5 a name with  spaces\n";
        let manifest = Manifest::parse(ManifestFormat::Sha256New, line).unwrap();
        assert_eq!(
            manifest.nodes()[0],
            ManifestNode::File {
                digest: "abcd".to_owned(),
                mtime: 100,
                size: 5,
                name: "a name with  spaces".to_owned(),
            }
        );
    }

    #[test_case("Q abcd 1 2 x" ; "unknown leader")]
    #[test_case("F abcd 1 2" ; "file missing name")]
    #[test_case("F abcd nan 2 x" ; "bad mtime")]
    #[test_case("F abcd 1 nan x" ; "bad size")]
    #[test_case("S abcd x" ; "symlink missing name")]
    #[test_case("D sub" ; "unrooted dir")]
    #[test_case("" ; "empty line")]
    #[test_case("F" ; "leader only")]
    fn malformed_lines_are_rejected(line: &str) {
        let text = format!("{line}\n");
        let err = Manifest::parse(ManifestFormat::Sha256New, &text).unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn old_format_dir_line_needs_mtime() {
        assert!(Manifest::parse(ManifestFormat::Sha256, "D /\n").is_err());
        assert!(Manifest::parse(ManifestFormat::Sha256New, "D /\n").is_ok());
    }

    #[test]
    fn save_load_round_trips_byte_identically() {
        let dir = Utf8TempDir::new().unwrap();
        write_tree(dir.path(), &[("a", b"1"), ("b/c", b"2")]);
        let handler = SilentHandler::new();
        let manifest =
            Manifest::generate(dir.path(), ManifestFormat::Sha1New, &handler).unwrap();

        let path = dir.path().join("saved.manifest");
        manifest.save(&path).unwrap();
        let loaded = Manifest::load(&path, ManifestFormat::Sha1New).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(fs::read(&path).unwrap(), manifest.serialize().into_bytes());
    }

    #[test]
    fn cancelled_token_aborts_generation() {
        let dir = Utf8TempDir::new().unwrap();
        write_tree(dir.path(), &[("a", b"1")]);
        let handler = SilentHandler::new();
        handler.cancel_token().cancel();
        let err =
            Manifest::generate(dir.path(), ManifestFormat::Sha256New, &handler).unwrap_err();
        assert!(matches!(err, ManifestGenError::Cancelled));
    }

    /// Strategy for a small tree: relative path fragments mapped to contents.
    fn tree_strategy() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
        let name = proptest::string::string_regex("[a-z][a-z0-9 ]{0,6}").unwrap();
        let rel = proptest::collection::vec(name, 1..3).prop_map(|parts| parts.join("/"));
        let contents = proptest::collection::vec(any::<u8>(), 0..256);
        proptest::collection::btree_map(rel, contents, 0..8)
            .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn generation_is_idempotent(files in tree_strategy()) {
            let dir = Utf8TempDir::new().unwrap();
            for (rel, contents) in &files {
                let path = dir.path().join(rel);
                if let Some(parent) = path.parent() {
                    // A prefix of one path may already exist as a file; skip
                    // those cases rather than constrain the strategy.
                    if fs::create_dir_all(parent).is_err() {
                        continue;
                    }
                }
                let _ = fs::write(&path, contents);
            }

            let handler = SilentHandler::new();
            for format in ManifestFormat::ALL {
                let first = Manifest::generate(dir.path(), format, &handler).unwrap();
                let second = Manifest::generate(dir.path(), format, &handler).unwrap();
                prop_assert_eq!(first.serialize(), second.serialize());
                prop_assert_eq!(first.digest_id(), second.digest_id());

                let parsed = Manifest::parse(format, &first.serialize()).unwrap();
                prop_assert_eq!(&parsed, &first);
            }
        }
    }
}
