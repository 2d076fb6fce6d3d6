// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Filesystem plumbing for the directory store: the mtime-accuracy probe,
//! write protection, and tree copying.

use crate::errors::{AddError, StoreOpenError};
use camino::Utf8Path;
use filetime::FileTime;
use rand::RngExt;
use std::{fs, io};
use tracing::debug;

/// Whether a store root accepts mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreAccess {
    ReadWrite,
    ReadOnly,
}

/// A transient dot-prefixed name, excluded from store listings.
pub(crate) fn transient_name(prefix: &str) -> String {
    format!("{prefix}{:08x}", rand::rng().random::<u32>())
}

/// Verifies that the filesystem under `root` stores mtimes to 1-second
/// accuracy by writing a probe file with a known mtime and reading it back.
///
/// A root that cannot be written to at all yields a read-only store, which
/// skips the probe: lookups never depend on mtime accuracy, only installs do.
pub(crate) fn probe_time_accuracy(root: &Utf8Path) -> Result<StoreAccess, StoreOpenError> {
    const PROBE_MTIME: i64 = 1_234_567_890;

    let probe = root.join(transient_name(".probe-"));
    let open_err = |error: io::Error| StoreOpenError::Io {
        store_root: root.to_owned(),
        error,
    };

    match fs::File::create(&probe) {
        Ok(_) => {}
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
            ) =>
        {
            debug!("store root {root} is not writable, treating store as read-only");
            return Ok(StoreAccess::ReadOnly);
        }
        Err(error) => return Err(open_err(error)),
    }

    let result = (|| {
        filetime::set_file_mtime(&probe, FileTime::from_unix_time(PROBE_MTIME, 0))?;
        let meta = fs::metadata(&probe)?;
        Ok(FileTime::from_last_modification_time(&meta).unix_seconds())
    })();
    let cleanup = fs::remove_file(&probe);

    let actual = result.map_err(open_err)?;
    cleanup.map_err(open_err)?;

    if actual != PROBE_MTIME {
        return Err(StoreOpenError::InsufficientTimeAccuracy {
            store_root: root.to_owned(),
            expected: PROBE_MTIME,
            actual,
        });
    }
    Ok(StoreAccess::ReadWrite)
}

/// Makes an installed tree read-only. Errors are for the caller to log and
/// swallow; failing to protect never fails an install.
pub(crate) fn apply_write_protection(root: &Utf8Path) -> io::Result<()> {
    set_protection(root, true)
}

/// Makes a tree writable again, ahead of removal or optimisation.
pub(crate) fn lift_write_protection(root: &Utf8Path) -> io::Result<()> {
    set_protection(root, false)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn set_protection(root: &Utf8Path, protect: bool) -> io::Result<()> {
            use std::os::unix::fs::PermissionsExt;

            for entry in walkdir::WalkDir::new(root).follow_links(false) {
                let entry = entry.map_err(io::Error::other)?;
                let file_type = entry.file_type();
                if file_type.is_symlink() {
                    continue;
                }
                let mode = if file_type.is_dir() {
                    if protect { 0o555 } else { 0o755 }
                } else {
                    let executable =
                        entry.metadata().map_err(io::Error::other)?.permissions().mode() & 0o111
                            != 0;
                    match (protect, executable) {
                        (true, true) => 0o555,
                        (true, false) => 0o444,
                        (false, true) => 0o755,
                        (false, false) => 0o644,
                    }
                };
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
            }
            Ok(())
        }
    } else {
        fn set_protection(root: &Utf8Path, protect: bool) -> io::Result<()> {
            // A live deny-write ACL blocks attribute changes too, so it must
            // come off before the attribute walk when lifting.
            #[cfg(windows)]
            if !protect {
                acl::set_everyone_write_deny(root, false)?;
            }
            for entry in walkdir::WalkDir::new(root).follow_links(false) {
                let entry = entry.map_err(io::Error::other)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let metadata = entry.metadata().map_err(io::Error::other)?;
                let mut permissions = metadata.permissions();
                permissions.set_readonly(protect);
                fs::set_permissions(entry.path(), permissions)?;
            }
            // The read-only attribute alone does not stop renames or new
            // files on NTFS; the deny-write ACL does.
            #[cfg(windows)]
            if protect {
                acl::set_everyone_write_deny(root, true)?;
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
mod acl {
    use camino::Utf8Path;
    use std::{io, os::windows::ffi::OsStrExt, ptr};
    use windows_sys::Win32::{
        Foundation::{ERROR_SUCCESS, LocalFree},
        Security::{
            ACL, CreateWellKnownSid, DACL_SECURITY_INFORMATION, SECURITY_MAX_SID_SIZE,
            WinWorldSid,
            Authorization::{
                DENY_ACCESS, EXPLICIT_ACCESS_W, GetNamedSecurityInfoW, NO_MULTIPLE_TRUSTEE,
                REVOKE_ACCESS, SE_FILE_OBJECT, SUB_CONTAINERS_AND_OBJECTS_INHERIT,
                SetEntriesInAclW, SetNamedSecurityInfoW, TRUSTEE_IS_SID,
                TRUSTEE_IS_WELL_KNOWN_GROUP, TRUSTEE_W,
            },
        },
        Storage::FileSystem::FILE_GENERIC_WRITE,
    };

    /// Adds (`deny = true`) or revokes an inheritable deny-write ACE for
    /// Everyone on the implementation root's DACL.
    pub(super) fn set_everyone_write_deny(root: &Utf8Path, deny: bool) -> io::Result<()> {
        let wide: Vec<u16> = root
            .as_std_path()
            .as_os_str()
            .encode_wide()
            .chain([0])
            .collect();

        let mut sid = [0u8; SECURITY_MAX_SID_SIZE as usize];
        let mut sid_len = sid.len() as u32;
        // SAFETY: the buffer is SECURITY_MAX_SID_SIZE bytes, the documented
        // upper bound for any SID.
        let ok = unsafe {
            CreateWellKnownSid(
                WinWorldSid,
                ptr::null_mut(),
                sid.as_mut_ptr().cast(),
                &mut sid_len,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut old_dacl: *mut ACL = ptr::null_mut();
        let mut descriptor = ptr::null_mut();
        // SAFETY: out-pointers are valid; the returned descriptor (which
        // owns old_dacl) is released below.
        let status = unsafe {
            GetNamedSecurityInfoW(
                wide.as_ptr(),
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut old_dacl,
                ptr::null_mut(),
                &mut descriptor,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(io::Error::from_raw_os_error(status as i32));
        }

        let entry = EXPLICIT_ACCESS_W {
            grfAccessPermissions: FILE_GENERIC_WRITE,
            grfAccessMode: if deny { DENY_ACCESS } else { REVOKE_ACCESS },
            grfInheritance: SUB_CONTAINERS_AND_OBJECTS_INHERIT,
            Trustee: TRUSTEE_W {
                pMultipleTrustee: ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_WELL_KNOWN_GROUP,
                ptstrName: sid.as_mut_ptr().cast(),
            },
        };
        let mut new_dacl: *mut ACL = ptr::null_mut();
        // SAFETY: one entry is passed, and old_dacl came from
        // GetNamedSecurityInfoW above.
        let status = unsafe { SetEntriesInAclW(1, &entry, old_dacl, &mut new_dacl) };
        if status != ERROR_SUCCESS {
            // SAFETY: descriptor was allocated by GetNamedSecurityInfoW.
            unsafe { LocalFree(descriptor) };
            return Err(io::Error::from_raw_os_error(status as i32));
        }

        // SAFETY: new_dacl is a valid DACL from SetEntriesInAclW.
        let status = unsafe {
            SetNamedSecurityInfoW(
                wide.as_ptr(),
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION,
                ptr::null_mut(),
                ptr::null_mut(),
                new_dacl,
                ptr::null(),
            )
        };
        // SAFETY: both allocations came from the security APIs above.
        unsafe {
            LocalFree(new_dacl.cast());
            LocalFree(descriptor);
        }
        if status != ERROR_SUCCESS {
            return Err(io::Error::from_raw_os_error(status as i32));
        }
        Ok(())
    }
}

/// Recursively copies `src` into the existing directory `dst`, preserving
/// mtimes, permission bits, and (on Unix) symbolic links. The mtime of `dst`
/// itself is set to match `src`: the root directory appears on old-family
/// manifest lines, so it is part of the digest.
///
/// Directory mtimes are restored after their contents are written, since
/// creating a child bumps the parent's mtime.
pub(crate) fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<(), AddError> {
    copy_tree_inner(src, dst)?;
    let meta = fs::metadata(src).map_err(|error| AddError::Io {
        path: src.to_owned(),
        error,
    })?;
    filetime::set_file_mtime(dst, FileTime::from_last_modification_time(&meta)).map_err(
        |error| AddError::Io {
            path: dst.to_owned(),
            error,
        },
    )?;
    Ok(())
}

fn copy_tree_inner(src: &Utf8Path, dst: &Utf8Path) -> Result<(), AddError> {
    let io_err = |path: &Utf8Path| {
        let path = path.to_owned();
        move |error: io::Error| AddError::Io { path, error }
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        entries.push(entry.file_name());
    }

    for name in entries {
        let name = name.to_str().ok_or_else(|| AddError::Io {
            path: src.to_owned(),
            error: io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 file name"),
        })?;
        let src_path = src.join(name);
        let dst_path = dst.join(name);
        let meta = fs::symlink_metadata(&src_path).map_err(io_err(&src_path))?;

        if meta.file_type().is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        } else if meta.is_dir() {
            fs::create_dir(&dst_path).map_err(io_err(&dst_path))?;
            copy_tree_inner(&src_path, &dst_path)?;
            let mtime = FileTime::from_last_modification_time(&meta);
            filetime::set_file_mtime(&dst_path, mtime).map_err(io_err(&dst_path))?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(io_err(&dst_path))?;
            let mtime = FileTime::from_last_modification_time(&meta);
            filetime::set_file_mtime(&dst_path, mtime).map_err(io_err(&dst_path))?;
        }
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn copy_symlink(src: &Utf8Path, dst: &Utf8Path) -> Result<(), AddError> {
            let target = fs::read_link(src).map_err(|error| AddError::Io {
                path: src.to_owned(),
                error,
            })?;
            std::os::unix::fs::symlink(&target, dst).map_err(|error| AddError::Io {
                path: dst.to_owned(),
                error,
            })
        }
    } else {
        fn copy_symlink(src: &Utf8Path, dst: &Utf8Path) -> Result<(), AddError> {
            // Symlink-ness travels in the .symlink sidecar on these
            // platforms; the file itself is copied like any other.
            fs::copy(src, dst).map(|_| ()).map_err(|error| AddError::Io {
                path: dst.to_owned(),
                error,
            })
        }
    }
}
