// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by implstore.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error that occurred while opening a [`DirectoryStore`].
///
/// [`DirectoryStore`]: crate::store::DirectoryStore
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreOpenError {
    /// The backing filesystem does not store mtimes to 1-second accuracy.
    ///
    /// Manifests record whole-second mtimes; a coarser filesystem would make
    /// every digest verification fail.
    #[error(
        "filesystem at `{store_root}` does not store mtimes to 1-second accuracy \
         (wrote {expected}, read back {actual})"
    )]
    InsufficientTimeAccuracy {
        /// The store root that was probed.
        store_root: Utf8PathBuf,
        /// The mtime written by the probe, in seconds.
        expected: i64,
        /// The mtime read back, in seconds.
        actual: i64,
    },

    /// An I/O error occurred while creating or probing the store root.
    #[error("error initializing store at `{store_root}`")]
    Io {
        /// The store root.
        store_root: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while parsing a digest string.
#[derive(Clone, Debug, Error)]
#[error("`{input}` is not a digest string of the form `<algorithm>=<value>`")]
pub struct DigestParseError {
    /// The input that failed to parse.
    pub input: String,
}

/// A requested implementation is not present in the store.
#[derive(Clone, Debug, Error)]
#[error("implementation `{digest}` not found in store")]
pub struct ImplementationNotFound {
    /// The best digest string that was looked up.
    pub digest: String,
}

/// An error that occurred while generating a manifest from a directory tree.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestGenError {
    /// A file or directory name is not valid UTF-8.
    #[error("name `{path}` is not valid UTF-8")]
    NonUtf8Name {
        /// The offending path, lossily decoded.
        path: String,
    },

    /// A name contains a newline, which the line-oriented format forbids.
    #[error("name `{name}` contains a newline")]
    NewlineInName {
        /// The offending name, escaped.
        name: String,
    },

    /// An I/O error occurred while walking or hashing the tree.
    #[error("error reading `{path}` while generating manifest")]
    Io {
        /// The path being read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The operation was cancelled through the task handler's token.
    #[error("manifest generation cancelled")]
    Cancelled,
}

/// An error that occurred while parsing a stored manifest.
#[derive(Clone, Debug, Error)]
#[error("malformed manifest at line {line}: {kind}")]
pub struct MalformedManifest {
    /// 1-based line number of the offending line.
    pub line: usize,
    /// What was wrong with it.
    pub kind: MalformedManifestKind,
}

/// The ways a manifest line can be malformed.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum MalformedManifestKind {
    /// The leading character is not one of `F`, `X`, `S`, `D`.
    #[error("unknown leader `{leader}`")]
    UnknownLeader {
        /// The leader that was seen.
        leader: char,
    },

    /// The line has the wrong number of space-separated parts for its leader.
    #[error("wrong number of fields for `{leader}` line")]
    WrongFieldCount {
        /// The line's leader.
        leader: char,
    },

    /// A numeric field did not parse.
    #[error("invalid {field} `{value}`")]
    InvalidNumber {
        /// Which field failed (`mtime` or `size`).
        field: &'static str,
        /// The value that failed to parse.
        value: String,
    },

    /// A directory path is not slash-rooted.
    #[error("directory path `{path}` does not start with `/`")]
    UnrootedPath {
        /// The path that was seen.
        path: String,
    },

    /// The manifest contains an empty line.
    #[error("empty line")]
    EmptyLine,
}

/// An error that occurred while loading a stored `.manifest` file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestLoadError {
    /// The file could not be read.
    #[error("error reading manifest at `{path}`")]
    Io {
        /// The manifest path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The file's contents are not a valid manifest.
    #[error(transparent)]
    Malformed(#[from] MalformedManifest),
}

/// An error that occurred while extracting an archive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtractError {
    /// No extractor is registered for the archive's MIME type.
    #[error("unsupported archive MIME type `{mime_type}`")]
    UnsupportedArchiveType {
        /// The MIME type that was requested.
        mime_type: String,
    },

    /// The archive bytes could not be parsed.
    #[error("error reading archive")]
    Archive {
        /// The underlying error.
        #[source]
        error: zip::result::ZipError,
    },

    /// An entry path escapes the destination (absolute, or contains `..`).
    #[error("archive entry `{path}` has an unsafe path")]
    UnsafeEntryPath {
        /// The entry path as stored in the archive.
        path: String,
    },

    /// An I/O error occurred while writing extracted output.
    #[error("error writing `{path}` during extraction")]
    Io {
        /// The destination path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The operation was cancelled through the task handler's token.
    #[error("extraction cancelled")]
    Cancelled,
}

/// An error that occurred while adding an implementation to the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AddError {
    /// The expected digest carries no known algorithm; a caller bug.
    #[error("expected digest carries no known algorithm")]
    NoKnownDigest,

    /// The recomputed digest of the staged tree does not match the expected
    /// digest. Never retried: the staged bytes are authoritatively wrong.
    #[error("digest mismatch: expected `{expected}`, actual `{actual}`")]
    DigestMismatch {
        /// The digest the caller expected.
        expected: String,
        /// The digest actually computed from the staged tree.
        actual: String,
        /// The manifest text that produced `actual`, for diagnostics.
        manifest: String,
    },

    /// The target directory already exists; a concurrent install won the
    /// rename race. Fetch callers treat this as success.
    #[error("implementation `{digest}` is already in the store")]
    AlreadyInStore {
        /// The digest string.
        digest: String,
    },

    /// Manifest generation over the staged tree failed.
    #[error(transparent)]
    Manifest(#[from] ManifestGenError),

    /// Archive extraction into the staging directory failed.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The store is read-only or another I/O error occurred.
    #[error("I/O error at `{path}` while adding to store")]
    Io {
        /// The path involved.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while removing an implementation from the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoveError {
    /// No sub-directory matches any algorithm of the digest.
    #[error(transparent)]
    NotFound(#[from] ImplementationNotFound),

    /// An I/O error occurred while renaming or deleting.
    #[error("I/O error at `{path}` while removing from store")]
    Io {
        /// The path involved.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while enumerating or auditing the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreScanError {
    /// An I/O error occurred while reading the store root.
    #[error("error scanning store at `{store_root}`")]
    Io {
        /// The store root.
        store_root: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred during a single download transfer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DownloadError {
    /// The HTTP request failed (connect, TLS, status, or timeout).
    #[error("network error fetching `{url}`")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying error.
        #[source]
        error: Box<ureq::Error>,
    },

    /// The number of bytes served does not match the declared size.
    /// Never retried: the server is authoritatively wrong.
    #[error("size mismatch fetching `{url}`: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The expected byte count.
        expected: u64,
        /// The actual byte count.
        actual: u64,
        /// The URL being fetched.
        url: String,
    },

    /// An I/O error occurred while writing the downloaded bytes.
    #[error("error writing downloaded bytes to `{path}`")]
    Io {
        /// The local sink path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Two files within one job share a URL and sink.
    #[error("duplicate file `{url}` in download job")]
    DuplicateFile {
        /// The duplicated URL.
        url: String,
    },

    /// The job was cancelled.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// True for transient failures the scheduler may retry.
    ///
    /// Size mismatches are permanent per the retry policy; cancellation is
    /// deliberate.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network { .. } | DownloadError::Io { .. } => true,
            DownloadError::SizeMismatch { .. }
            | DownloadError::DuplicateFile { .. }
            | DownloadError::Cancelled => false,
        }
    }
}

/// An error that occurred while fetching implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The implementation offers neither archives nor recipes; a caller bug.
    #[error("implementation `{digest}` has no retrieval method")]
    NoRetrievalMethod {
        /// The implementation's best digest string.
        digest: String,
    },

    /// The implementation's digest carries no known algorithm.
    #[error("implementation digest carries no known algorithm")]
    NoKnownDigest,

    /// A download failed after exhausting retries.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Verification or installation in the store failed.
    #[error(transparent)]
    Store(#[from] AddError),

    /// A concurrent fetch of the same digest performed the work and failed.
    #[error("concurrent fetch of `{digest}` failed")]
    FlightFailed {
        /// The digest whose fetch was awaited.
        digest: String,
    },

    /// The fetch was cancelled.
    #[error("fetch cancelled")]
    Cancelled,
}

/// An error that occurred while parsing a [`CoreConfig`].
///
/// [`CoreConfig`]: crate::config::CoreConfig
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseError {
    /// The configuration file could not be read.
    #[error("error reading config at `{path}`")]
    Read {
        /// The config file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The TOML did not deserialize.
    #[error("error parsing config")]
    Parse {
        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },
}
