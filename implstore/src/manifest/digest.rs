// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Digest algorithms, formats, and the multi-algorithm digest value.

use crate::errors::DigestParseError;
use data_encoding::BASE32_NOPAD;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// A manifest format: the hash algorithm plus the textual conventions tied
/// to it.
///
/// The `sha1`/`sha256` ("old") family emits directory lines that carry an
/// mtime and encodes the final digest as lowercase hex. The `sha1new`/
/// `sha256new` ("new") family emits bare `D <path>` directory lines and
/// encodes the final digest as lowercase unpadded base32. Per-file hashes on
/// manifest lines are lowercase hex in every format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestFormat {
    /// SHA-1, old directory lines, hex digest.
    Sha1,
    /// SHA-1, new directory lines, base32 digest.
    Sha1New,
    /// SHA-256, old directory lines, hex digest.
    Sha256,
    /// SHA-256, new directory lines, base32 digest.
    Sha256New,
}

impl ManifestFormat {
    /// All formats, strongest first. This is the preference order used to
    /// pick the "best" algorithm of a [`ManifestDigest`].
    pub const ALL: [Self; 4] = [Self::Sha256New, Self::Sha256, Self::Sha1New, Self::Sha1];

    /// The digest-string prefix, e.g. `sha256new` in `sha256new=...`.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha1New => "sha1new",
            Self::Sha256 => "sha256",
            Self::Sha256New => "sha256new",
        }
    }

    /// Looks up a format by its digest-string prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.prefix() == prefix)
    }

    /// True if directory lines in this format carry an mtime.
    ///
    /// A compatibility wart of the old family, preserved because the mtime
    /// contributes to digests of existing stores.
    pub fn dir_lines_include_mtime(self) -> bool {
        matches!(self, Self::Sha1 | Self::Sha256)
    }

    /// Starts a streaming hash under this format's algorithm.
    pub fn new_hasher(self) -> Hasher {
        match self {
            Self::Sha1 | Self::Sha1New => Hasher(HasherKind::Sha1(Sha1::new())),
            Self::Sha256 | Self::Sha256New => Hasher(HasherKind::Sha256(Sha256::new())),
        }
    }

    /// Hashes `data` and returns the lowercase hex used on manifest lines.
    pub fn hash_to_hex(self, data: &[u8]) -> String {
        let mut hasher = self.new_hasher();
        hasher.update(data);
        hex::encode(hasher.finish())
    }

    /// Encodes a raw hash in this format's digest-string encoding.
    pub fn encode_digest(self, hash: &[u8]) -> String {
        match self {
            Self::Sha1 | Self::Sha256 => hex::encode(hash),
            Self::Sha1New | Self::Sha256New => BASE32_NOPAD.encode(hash).to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A streaming hasher for one of the supported algorithms.
pub struct Hasher(HasherKind);

enum HasherKind {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            HasherKind::Sha1(h) => h.update(data),
            HasherKind::Sha256(h) => h.update(data),
        }
    }

    /// Finishes the hash and returns the raw bytes.
    pub fn finish(self) -> Vec<u8> {
        match self.0 {
            HasherKind::Sha1(h) => h.finalize().to_vec(),
            HasherKind::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// A mapping from digest algorithms to encoded digest values.
///
/// At least one algorithm must be populated for the digest to name an
/// implementation; [`best`](Self::best) picks the strongest populated one.
/// Values are stored without their prefix; [`id_for`](Self::id_for) renders
/// the full `<prefix>=<value>` digest string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestDigest {
    /// The `sha1=...` value, if known.
    pub sha1: Option<String>,
    /// The `sha1new=...` value, if known.
    pub sha1new: Option<String>,
    /// The `sha256=...` value, if known.
    pub sha256: Option<String>,
    /// The `sha256new=...` value, if known.
    pub sha256new: Option<String>,
}

impl ManifestDigest {
    /// Creates an empty digest. An empty digest names nothing; stores reject
    /// it with `NoKnownDigest`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a digest from a single `<prefix>=<value>` string.
    pub fn from_id(id: &str) -> Result<Self, DigestParseError> {
        let (format, value) = Self::parse_id(id).ok_or_else(|| DigestParseError {
            input: id.to_owned(),
        })?;
        let mut digest = Self::new();
        digest.set(format, value.to_owned());
        Ok(digest)
    }

    /// Splits a digest string into its format and encoded value.
    ///
    /// Returns `None` for unknown prefixes or strings without a `=`.
    pub fn parse_id(id: &str) -> Option<(ManifestFormat, &str)> {
        let (prefix, value) = id.split_once('=')?;
        if value.is_empty() {
            return None;
        }
        let format = ManifestFormat::from_prefix(prefix)?;
        Some((format, value))
    }

    /// Returns the encoded value for `format`, if populated.
    pub fn get(&self, format: ManifestFormat) -> Option<&str> {
        self.slot(format).as_deref()
    }

    /// Populates the value for `format`.
    pub fn set(&mut self, format: ManifestFormat, value: String) {
        *self.slot_mut(format) = Some(value);
    }

    /// True if no algorithm is populated.
    pub fn is_empty(&self) -> bool {
        ManifestFormat::ALL.iter().all(|f| self.get(*f).is_none())
    }

    /// The strongest populated algorithm and its value.
    pub fn best(&self) -> Option<(ManifestFormat, &str)> {
        ManifestFormat::ALL
            .into_iter()
            .find_map(|f| self.get(f).map(|value| (f, value)))
    }

    /// The full digest string for `format`, if populated.
    pub fn id_for(&self, format: ManifestFormat) -> Option<String> {
        self.get(format)
            .map(|value| format!("{}={value}", format.prefix()))
    }

    /// The full digest string of the strongest populated algorithm.
    pub fn best_id(&self) -> Option<String> {
        self.best()
            .map(|(format, value)| format!("{}={value}", format.prefix()))
    }

    /// All populated digest strings, strongest first.
    pub fn ids(&self) -> impl Iterator<Item = String> + '_ {
        ManifestFormat::ALL
            .into_iter()
            .filter_map(|f| self.id_for(f))
    }

    fn slot(&self, format: ManifestFormat) -> &Option<String> {
        match format {
            ManifestFormat::Sha1 => &self.sha1,
            ManifestFormat::Sha1New => &self.sha1new,
            ManifestFormat::Sha256 => &self.sha256,
            ManifestFormat::Sha256New => &self.sha256new,
        }
    }

    fn slot_mut(&mut self, format: ManifestFormat) -> &mut Option<String> {
        match format {
            ManifestFormat::Sha1 => &mut self.sha1,
            ManifestFormat::Sha1New => &mut self.sha1new,
            ManifestFormat::Sha256 => &mut self.sha256,
            ManifestFormat::Sha256New => &mut self.sha256new,
        }
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.best_id() {
            Some(id) => f.write_str(&id),
            None => f.write_str("(no digest)"),
        }
    }
}
