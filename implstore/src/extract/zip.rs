// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ZIP extraction (PKZIP, store + deflate).

use super::{apply_sub_dir, validate_entry_path};
use crate::{
    errors::ExtractError,
    helpers::CHUNK_SIZE,
    task::{TaskHandler, TaskInfo},
};
use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
};
use zip::ZipArchive;

#[cfg(not(unix))]
use crate::sidecar::{SYMLINK_FILE_NAME, Sidecar, XBIT_FILE_NAME};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Extracts a ZIP archive into a destination directory.
pub struct ZipExtractor {
    source: fs::File,
    start_offset: u64,
    destination: Utf8PathBuf,
    sub_dir: Option<String>,
}

impl ZipExtractor {
    /// Creates an extractor reading `source` from `start_offset` onwards.
    pub fn new(source: fs::File, start_offset: u64, destination: Utf8PathBuf) -> Self {
        Self {
            source,
            start_offset,
            destination,
            sub_dir: None,
        }
    }

    fn io_err(path: &Utf8Path) -> impl Fn(io::Error) -> ExtractError + '_ {
        move |error| ExtractError::Io {
            path: path.to_owned(),
            error,
        }
    }
}

impl super::Extractor for ZipExtractor {
    fn set_sub_dir(&mut self, sub_dir: &str) {
        self.sub_dir = Some(sub_dir.to_owned());
    }

    fn run(&mut self, handler: &dyn TaskHandler) -> Result<(), ExtractError> {
        handler.starting_extraction(&TaskInfo::new(self.destination.as_str()));
        let token = handler.cancel_token();

        let reader = OffsetReader::new(&mut self.source, self.start_offset);
        let mut archive =
            ZipArchive::new(reader).map_err(|error| ExtractError::Archive { error })?;

        // Directory mtimes are applied after all entries are written, deepest
        // first: writing a file would otherwise bump its parent's mtime. The
        // destination root gets the newest entry mtime, so trees extracted
        // from the same archive agree on every directory line, the root's
        // old-family line included.
        let mut dir_mtimes: Vec<(Utf8PathBuf, i64)> = Vec::new();
        let mut max_mtime: Option<i64> = None;
        #[cfg(not(unix))]
        let mut xbit = Sidecar::default();
        #[cfg(not(unix))]
        let mut symlinks = Sidecar::default();

        for index in 0..archive.len() {
            if token.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            let mut entry = archive
                .by_index(index)
                .map_err(|error| ExtractError::Archive { error })?;

            let entry_path = validate_entry_path(entry.name())?;
            let Some(rel) = apply_sub_dir(&entry_path, self.sub_dir.as_deref()) else {
                continue;
            };
            let out_path = self.destination.join(rel);
            let mtime = dos_to_unix(entry.last_modified());
            max_mtime = Some(max_mtime.map_or(mtime, |current| current.max(mtime)));
            let mode = entry.unix_mode();

            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(Self::io_err(&out_path))?;
                dir_mtimes.push((out_path, mtime));
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(Self::io_err(parent))?;
            }

            // Recipe overlays replace earlier entries outright; writing
            // through an existing symlink would corrupt its target instead.
            remove_existing(&out_path)?;

            if mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
                let mut target = String::new();
                entry
                    .read_to_string(&mut target)
                    .map_err(Self::io_err(&out_path))?;
                place_symlink(&target, &out_path)?;
                #[cfg(not(unix))]
                symlinks.insert(rooted(rel));
                continue;
            }

            write_entry(&mut entry, &out_path, token)?;
            filetime::set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0))
                .map_err(Self::io_err(&out_path))?;

            if let Some(mode) = mode {
                if mode & 0o777 != 0 {
                    apply_mode(&out_path, mode & 0o777)?;
                }
                #[cfg(not(unix))]
                if mode & 0o100 != 0 {
                    xbit.insert(rooted(rel));
                }
            }
        }

        // Deepest directories first so parent mtimes are set last.
        dir_mtimes.sort_by(|a, b| b.0.as_str().len().cmp(&a.0.as_str().len()));
        for (dir, mtime) in dir_mtimes {
            filetime::set_file_mtime(&dir, FileTime::from_unix_time(mtime, 0))
                .map_err(Self::io_err(&dir))?;
        }
        if let Some(mtime) = max_mtime {
            filetime::set_file_mtime(&self.destination, FileTime::from_unix_time(mtime, 0))
                .map_err(Self::io_err(&self.destination))?;
        }

        #[cfg(not(unix))]
        {
            if !xbit.is_empty() {
                xbit.save(&self.destination, XBIT_FILE_NAME)
                    .map_err(Self::io_err(&self.destination))?;
            }
            if !symlinks.is_empty() {
                symlinks
                    .save(&self.destination, SYMLINK_FILE_NAME)
                    .map_err(Self::io_err(&self.destination))?;
            }
        }

        Ok(())
    }
}

fn remove_existing(path: &Utf8Path) -> Result<(), ExtractError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(ExtractError::Io {
            path: path.to_owned(),
            error,
        }),
    }
}

fn write_entry(
    entry: &mut impl Read,
    out_path: &Utf8Path,
    token: &crate::task::CancelToken,
) -> Result<(), ExtractError> {
    let io_err = ZipExtractor::io_err(out_path);
    let mut out = fs::File::create(out_path).map_err(&io_err)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if token.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        let n = entry.read(&mut buf).map_err(&io_err)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(&io_err)?;
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn place_symlink(target: &str, out_path: &Utf8Path) -> Result<(), ExtractError> {
            std::os::unix::fs::symlink(target, out_path)
                .map_err(|error| ExtractError::Io {
                    path: out_path.to_owned(),
                    error,
                })
        }

        fn apply_mode(path: &Utf8Path, mode: u32) -> Result<(), ExtractError> {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|error| {
                ExtractError::Io {
                    path: path.to_owned(),
                    error,
                }
            })
        }
    } else {
        fn place_symlink(target: &str, out_path: &Utf8Path) -> Result<(), ExtractError> {
            // The sidecar records link-ness; the file holds the target bytes.
            fs::write(out_path, target).map_err(|error| ExtractError::Io {
                path: out_path.to_owned(),
                error,
            })
        }

        fn apply_mode(_path: &Utf8Path, _mode: u32) -> Result<(), ExtractError> {
            Ok(())
        }
    }
}

#[cfg(not(unix))]
fn rooted(rel: &Utf8Path) -> String {
    format!("/{}", rel.as_str().replace('\\', "/"))
}

/// Presents `inner` as if the stream began at `offset`.
///
/// ZIP parsing seeks from the end of the stream to locate the central
/// directory, so skipping leading bytes cannot be done by simply consuming
/// them; every seek is translated instead.
struct OffsetReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read + Seek> OffsetReader<R> {
    fn new(mut inner: R, offset: u64) -> Self {
        // Position at the logical start; errors surface on first use.
        let _ = inner.seek(SeekFrom::Start(offset));
        Self { inner, offset }
    }
}

impl<R: Read> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let inner_pos = match pos {
            SeekFrom::Start(p) => self.inner.seek(SeekFrom::Start(p + self.offset))?,
            SeekFrom::Current(d) => self.inner.seek(SeekFrom::Current(d))?,
            SeekFrom::End(d) => self.inner.seek(SeekFrom::End(d))?,
        };
        inner_pos.checked_sub(self.offset).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of embedded archive",
            )
        })
    }
}

/// Converts an MS-DOS timestamp to Unix seconds, treating it as UTC.
///
/// Whole-second resolution is all the store requires; DOS timestamps have
/// 2-second granularity, which manifests simply record as-is.
fn dos_to_unix(dt: zip::DateTime) -> i64 {
    days_from_civil(i64::from(dt.year()), u32::from(dt.month()), u32::from(dt.day())) * 86_400
        + i64::from(dt.hour()) * 3_600
        + i64::from(dt.minute()) * 60
        + i64::from(dt.second())
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let doy = i64::from((153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1);
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
