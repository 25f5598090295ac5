//! Filesystem helpers for files that must never be readable by other users.
//!
//! Envelopes and key files are written with mode 0o600 on Unix systems.
//! Envelope rewrites are atomic (tempfile + fsync + rename) so a crash
//! leaves either the old or the new envelope, never a torn one.

use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Owner read/write only.
pub const OWNER_ONLY_FILE: u32 = 0o600;

/// Owner read/write, world readable.
pub const WORLD_READABLE_FILE: u32 = 0o644;

/// Owner-only directory.
pub const OWNER_ONLY_DIR: u32 = 0o700;

/// Write file with the given permissions, creating or truncating it.
///
/// An existing file keeps its inode but has its mode reset, so a file
/// that was previously world readable does not stay that way.
pub fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .map_err(|e| NotesealError::io("open", path, e))?;
        // Through the handle, so a path swapped for a symlink is not chmodded.
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| NotesealError::io("set permissions on", path, e))?;
        file.write_all(contents)
            .map_err(|e| NotesealError::io("write", path, e))?;
        file.sync_all()
            .map_err(|e| NotesealError::io("sync", path, e))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::write(path, contents).map_err(|e| NotesealError::io("write", path, e))
    }
}

/// Create `path` with the given permissions, failing with
/// `io::ErrorKind::AlreadyExists` if anything (a dangling symlink
/// included) is already there.
pub fn create_new_with_mode(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // The umask may have stripped bits the caller asked for.
        file.set_permissions(fs::Permissions::from_mode(mode))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

/// Write file with owner-only permissions (0o600 on Unix).
pub fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    write_with_mode(path, contents, OWNER_ONLY_FILE)
}

/// Atomically replace `path` with `contents`, owner-only.
///
/// The temp file lives in the destination directory so the final rename
/// never crosses a filesystem boundary.
pub fn replace_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp_file = tempfile::Builder::new()
        .prefix(".noteseal-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Operational,
                ErrorKind::Io,
                format!("failed to create tempfile in {}", dir.display()),
                e,
            )
        })?;

    temp_file
        .write_all(contents)
        .map_err(|e| NotesealError::io("write tempfile for", path, e))?;
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file
        .flush()
        .map_err(|e| NotesealError::io("flush tempfile for", path, e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| NotesealError::io("sync tempfile for", path, e))?;
    set_mode(temp_file.path(), OWNER_ONLY_FILE)?;

    temp_file.persist(path).map_err(|e| {
        NotesealError::with_kind_and_source(
            ErrorCategory::Operational,
            ErrorKind::Io,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

/// Set Unix permission bits. A no-op elsewhere.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| NotesealError::io("set permissions on", path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Permission bits of `path`, or `None` on hosts without Unix modes.
pub fn mode_of(path: &Path) -> Result<Option<u32>> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(path).map_err(|e| read_error(path, e))?;
        Ok(Some(metadata.permissions().mode() & 0o777))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(None)
    }
}

/// Read a whole file, tagging a missing file distinctly from other failures.
pub fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| read_error(path, e))
}

fn read_error(path: &Path, err: io::Error) -> NotesealError {
    NotesealError::with_kind_and_source(
        ErrorCategory::Operational,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}
