//! Session storage for decrypted plaintext
//!
//! Selected once per session from the host environment, strongest first:
//!
//! - `High`: a RAM-backed filesystem (`/dev/shm` on Linux). Plaintext never
//!   reaches persistent disk.
//! - `Medium`: the user-scoped temporary directory, with the session
//!   directory hardened to 0o700.
//! - `Low`: the generic temporary directory, used even if hardening could
//!   not be verified.
//!
//! Each session gets its own uniquely named directory. Every file operation
//! goes through [`SessionStorage::resolve`], which rejects any path that
//! does not land strictly inside that directory.
//!
//! `/dev/shm` is only offered as `High` when `/proc/mounts` lists it (or
//! the mount holding it) as tmpfs or ramfs.
//!
//! [`SessionStorage::secure_erase`] overwrites before unlinking. On
//! copy-on-write or log-structured filesystems (btrfs, APFS, ZFS, most
//! SSD firmware) the old blocks may survive anyway.

use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use crate::fsutil;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const SESSION_DIR_PREFIX: &str = "noteseal-";
const ERASE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityLevel::High => "high",
            SecurityLevel::Medium => "medium",
            SecurityLevel::Low => "low",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageProfile {
    pub platform: Platform,
    /// Canonical path of this session's private directory.
    pub base_path: PathBuf,
    pub security_level: SecurityLevel,
}

/// What users are told about where their plaintext lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub platform: Platform,
    pub security_level: SecurityLevel,
}

impl StorageInfo {
    /// Warning to show the user, if the level warrants one.
    pub fn warning(&self) -> Option<&'static str> {
        match self.security_level {
            SecurityLevel::High => None,
            SecurityLevel::Medium => Some(
                "decrypted notes are stored on disk with owner-only permissions; \
                 no RAM-backed storage is available on this host",
            ),
            SecurityLevel::Low => Some(
                "decrypted notes are stored in a shared temporary directory \
                 whose permissions could not be restricted",
            ),
        }
    }
}

/// The parts of the host environment storage selection depends on.
#[derive(Debug, Clone)]
pub struct HostEnv {
    pub platform: Platform,
    /// RAM-backed mount points, in order of preference.
    pub ram_roots: Vec<PathBuf>,
    /// User-scoped temporary directory, if the host has one.
    pub user_temp: Option<PathBuf>,
    /// Generic temporary directory.
    pub fallback_temp: PathBuf,
}

impl HostEnv {
    /// Inspect the running host.
    pub fn probe() -> Self {
        let platform = Platform::current();
        let fallback_temp = std::env::temp_dir();
        let (ram_roots, user_temp) = match platform {
            Platform::Linux => (
                {
                    let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
                    [PathBuf::from("/dev/shm")]
                        .into_iter()
                        .filter(|root| is_ram_mount(root, &mounts))
                        .collect()
                },
                std::env::var_os("XDG_RUNTIME_DIR")
                    .map(PathBuf::from)
                    .or_else(|| Some(fallback_temp.clone())),
            ),
            // TMPDIR on macOS is already per-user.
            Platform::MacOs => (Vec::new(), Some(fallback_temp.clone())),
            Platform::Windows => (
                Vec::new(),
                std::env::var_os("LOCALAPPDATA").map(|dir| PathBuf::from(dir).join("Temp")),
            ),
            Platform::Other => (Vec::new(), None),
        };
        Self {
            platform,
            ram_roots,
            user_temp,
            fallback_temp,
        }
    }
}

/// A session's private plaintext directory. Removed on [`remove`] or drop.
///
/// [`remove`]: SessionStorage::remove
#[derive(Debug)]
pub struct SessionStorage {
    profile: StorageProfile,
    dir: Mutex<Option<TempDir>>,
}

impl SessionStorage {
    /// Select storage for the running host.
    pub fn detect() -> Result<Self> {
        Self::detect_with(&HostEnv::probe())
    }

    /// Select storage from an explicit environment description.
    pub fn detect_with(env: &HostEnv) -> Result<Self> {
        let mut candidates: Vec<(&Path, SecurityLevel)> = Vec::new();
        for root in &env.ram_roots {
            candidates.push((root.as_path(), SecurityLevel::High));
        }
        if let Some(user_temp) = &env.user_temp {
            candidates.push((user_temp.as_path(), SecurityLevel::Medium));
        }
        candidates.push((env.fallback_temp.as_path(), SecurityLevel::Low));

        for (root, level) in candidates {
            match prepare_session_dir(root, level) {
                Ok((dir, base_path)) => {
                    let profile = StorageProfile {
                        platform: env.platform,
                        base_path,
                        security_level: level,
                    };
                    info!(
                        path = %profile.base_path.display(),
                        level = %level,
                        "session storage ready"
                    );
                    return Ok(Self {
                        profile,
                        dir: Mutex::new(Some(dir)),
                    });
                }
                Err(e) => {
                    debug!(root = %root.display(), level = %level, "storage candidate rejected: {}", e)
                }
            }
        }

        Err(NotesealError::with_kind(
            ErrorCategory::Operational,
            ErrorKind::StorageUnavailable,
            "no usable temporary storage location for decrypted notes",
        ))
    }

    pub fn profile(&self) -> &StorageProfile {
        &self.profile
    }

    pub fn base_path(&self) -> &Path {
        &self.profile.base_path
    }

    pub fn storage_info(&self) -> StorageInfo {
        StorageInfo {
            platform: self.profile.platform,
            security_level: self.profile.security_level,
        }
    }

    /// Resolve `path` (absolute, or relative to the base) to a canonical
    /// path strictly inside the base directory.
    ///
    /// Works for paths that do not exist yet: the deepest existing ancestor
    /// is canonicalized and the rest appended. Symlinks leading out of the
    /// directory are rejected.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        self.ensure_present()?;
        let base = self.base_path();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(outside(path));
        }
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        };

        let resolved = canonicalize_lenient(&candidate)
            .map_err(|e| NotesealError::io("resolve", &candidate, e))?;
        if resolved == base || !resolved.starts_with(base) {
            return Err(outside(path));
        }
        // Only a symlink that does not resolve survives canonicalization.
        // Its target is unknown until something creates it, so refuse it.
        for ancestor in resolved.ancestors().take_while(|a| *a != base) {
            if fs::symlink_metadata(ancestor).is_ok_and(|m| m.file_type().is_symlink()) {
                return Err(outside(path));
            }
        }
        Ok(resolved)
    }

    /// Create an owner-only directory (and parents) inside the base.
    pub fn create_dir(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        fs::create_dir_all(&resolved).map_err(|e| NotesealError::io("create", &resolved, e))?;
        fsutil::set_mode(&resolved, fsutil::OWNER_ONLY_DIR)?;
        Ok(resolved)
    }

    /// Write an owner-only file inside the base.
    ///
    /// The file is replaced by rename, which never follows a symlink that
    /// appears at `path` after it was resolved.
    pub fn write(&self, path: &Path, contents: &[u8]) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        fsutil::replace_atomic(&resolved, contents)?;
        Ok(resolved)
    }

    pub fn read(&self, path: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let resolved = self.resolve(path)?;
        Ok(Zeroizing::new(fsutil::read(&resolved)?))
    }

    /// Modification time and length, or `None` if the file is gone.
    pub fn fingerprint(&self, path: &Path) -> Result<Option<(SystemTime, u64)>> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved) {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map_err(|e| NotesealError::io("stat", &resolved, e))?;
                Ok(Some((modified, metadata.len())))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NotesealError::io("stat", &resolved, e)),
        }
    }

    /// Overwrite the file with random bytes, sync, truncate, then delete it.
    /// An emptied parent directory below the base is removed too. Erasing a
    /// file that does not exist succeeds.
    pub fn secure_erase(&self, path: &Path) -> Result<()> {
        let resolved = self.resolve(path)?;
        match fs::symlink_metadata(&resolved) {
            Ok(metadata) if metadata.is_file() => {
                overwrite(&resolved, metadata.len())?;
                fs::remove_file(&resolved)
                    .map_err(|e| NotesealError::io("remove", &resolved, e))?;
            }
            Ok(_) => {
                return Err(NotesealError::with_kind(
                    ErrorCategory::Operational,
                    ErrorKind::Io,
                    format!("refusing to erase non-regular file {}", resolved.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(NotesealError::io("stat", &resolved, e)),
        }

        if let Some(parent) = resolved.parent() {
            if parent != self.base_path() && parent.starts_with(self.base_path()) {
                // Fails harmlessly if something else still lives there.
                let _ = fs::remove_dir(parent);
            }
        }
        debug!(path = %resolved.display(), "plaintext erased");
        Ok(())
    }

    /// Erase every file left in the directory, then remove it.
    /// Later operations fail with `StorageUnavailable`.
    pub fn remove(&self) -> Result<()> {
        let Some(dir) = self.dir_slot().take() else {
            return Ok(());
        };
        let mut first_error = None;
        for file in files_below(dir.path()) {
            if let Err(e) = overwrite(&file, file_len(&file)) {
                warn!(path = %file.display(), "failed to overwrite leftover plaintext: {}", e);
                first_error.get_or_insert(e);
            }
        }
        let path = dir.path().to_path_buf();
        dir.close().map_err(|e| NotesealError::io("remove", &path, e))?;
        info!(path = %path.display(), "session storage removed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.dir_slot().is_none()
    }

    fn ensure_present(&self) -> Result<()> {
        if self.is_removed() {
            return Err(NotesealError::with_kind(
                ErrorCategory::Operational,
                ErrorKind::StorageUnavailable,
                "session storage has already been removed",
            ));
        }
        Ok(())
    }

    fn dir_slot(&self) -> std::sync::MutexGuard<'_, Option<TempDir>> {
        self.dir.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prepare_session_dir(root: &Path, level: SecurityLevel) -> io::Result<(TempDir, PathBuf)> {
    if !root.is_dir() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a directory"));
    }
    let dir = tempfile::Builder::new()
        .prefix(SESSION_DIR_PREFIX)
        .tempdir_in(root)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let hardened = fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))
            .and_then(|_| fs::metadata(dir.path()))
            .map(|metadata| metadata.permissions().mode() & 0o777 == 0o700)
            .unwrap_or(false);
        if !hardened {
            if level > SecurityLevel::Low {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "could not restrict directory to owner",
                ));
            }
            warn!(path = %dir.path().display(), "session storage permissions not restricted");
        }
    }
    #[cfg(not(unix))]
    let _ = level;

    let base_path = dir.path().canonicalize()?;
    Ok((dir, base_path))
}

/// Whether `path` lives on tmpfs or ramfs according to a `/proc/mounts`
/// table. The longest matching mount point wins.
fn is_ram_mount(path: &Path, mounts: &str) -> bool {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = Path::new(fields.next()?);
            let fs_type = fields.next()?;
            path.starts_with(mount_point)
                .then(|| (mount_point.as_os_str().len(), fs_type))
        })
        .max_by_key(|(depth, _)| *depth)
        .is_some_and(|(_, fs_type)| matches!(fs_type, "tmpfs" | "ramfs"))
}

/// Canonicalize a path whose tail may not exist yet: the deepest existing
/// ancestor is canonicalized and the missing components appended.
pub(crate) fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                return Ok(rest.iter().rev().fold(canonical, |acc, part| acc.join(part)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(e);
                };
                rest.push(name.to_os_string());
                existing = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

fn overwrite(path: &Path, len: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| NotesealError::io("open", path, e))?;
    let mut chunk = vec![0u8; ERASE_CHUNK];
    let mut remaining = len;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| NotesealError::io("seek", path, e))?;
    while remaining > 0 {
        let n = remaining.min(ERASE_CHUNK as u64) as usize;
        OsRng.fill_bytes(&mut chunk[..n]);
        file.write_all(&chunk[..n])
            .map_err(|e| NotesealError::io("overwrite", path, e))?;
        remaining -= n as u64;
    }
    file.sync_all()
        .map_err(|e| NotesealError::io("sync", path, e))?;
    file.set_len(0)
        .map_err(|e| NotesealError::io("truncate", path, e))?;
    Ok(())
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn files_below(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => pending.push(entry.path()),
                Ok(kind) if kind.is_file() => files.push(entry.path()),
                _ => {}
            }
        }
    }
    files
}

fn outside(path: &Path) -> NotesealError {
    NotesealError::with_kind(
        ErrorCategory::SecurityBoundary,
        ErrorKind::PathOutsideStorage,
        format!("{} is outside the session storage directory", path.display()),
    )
}
