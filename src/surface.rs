//! Editing surfaces: whatever shows a plaintext file to the user
//!
//! The lifecycle manager drives a surface through [`EditingSurface`] and
//! learns about edits through [`SurfaceEvent`]s, fed to
//! [`LifecycleManager::handle_event`](crate::lifecycle::LifecycleManager::handle_event).

use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Notification from a surface about a plaintext file it shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Content changed on disk. Re-encryption is debounced.
    Changed(PathBuf),
    /// The user saved explicitly. Re-encryption happens immediately.
    Saved(PathBuf),
    /// The surface stopped showing the file.
    Closed(PathBuf),
}

pub trait EditingSurface: Send + Sync {
    /// Present `path` for interactive editing under `display_name`.
    fn show(&self, path: &Path, display_name: &str) -> Result<()>;

    /// Stop showing `path`. Unsaved buffer contents are discarded.
    fn close(&self, path: &Path);

    /// Whether the surface holds edits for `path` not yet written to disk.
    fn has_unsaved_edits(&self, path: &Path) -> bool;
}

/// A surface with no UI. Tracks what it was asked to show.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    shown: Mutex<HashSet<PathBuf>>,
    dirty: Mutex<HashSet<PathBuf>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_showing(&self, path: &Path) -> bool {
        lock(&self.shown).contains(path)
    }

    /// Pretend the user has (or no longer has) unsaved edits in `path`.
    pub fn set_unsaved(&self, path: &Path, unsaved: bool) {
        let mut dirty = lock(&self.dirty);
        if unsaved {
            dirty.insert(path.to_path_buf());
        } else {
            dirty.remove(path);
        }
    }
}

impl EditingSurface for HeadlessSurface {
    fn show(&self, path: &Path, _display_name: &str) -> Result<()> {
        lock(&self.shown).insert(path.to_path_buf());
        Ok(())
    }

    fn close(&self, path: &Path) {
        lock(&self.shown).remove(path);
        lock(&self.dirty).remove(path);
    }

    fn has_unsaved_edits(&self, path: &Path) -> bool {
        lock(&self.dirty).contains(path)
    }
}

/// Opens each file in an external editor process (`$VISUAL`, `$EDITOR`,
/// or `vi`). Sends [`SurfaceEvent::Closed`] when the process exits.
///
/// The editor's unsaved buffer is invisible to us, so
/// `has_unsaved_edits` is always false; saved edits are picked up by the
/// lifecycle manager's change watch.
pub struct ExternalEditor {
    command: Vec<String>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    running: Mutex<HashMap<PathBuf, oneshot::Sender<()>>>,
}

impl ExternalEditor {
    pub fn new(events: mpsc::UnboundedSender<SurfaceEvent>) -> Self {
        let command = std::env::var("VISUAL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("EDITOR").ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "vi".to_string());
        Self::with_command(command.split_whitespace().map(str::to_string).collect(), events)
    }

    /// Use an explicit program and arguments. The file path is appended.
    pub fn with_command(command: Vec<String>, events: mpsc::UnboundedSender<SurfaceEvent>) -> Self {
        Self {
            command,
            events,
            running: Mutex::new(HashMap::new()),
        }
    }
}

impl EditingSurface for ExternalEditor {
    fn show(&self, path: &Path, display_name: &str) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(editor_error("no editor command configured"));
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| editor_error("external editor requires an async runtime"))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NotesealError::with_kind_and_source(
                    ErrorCategory::Operational,
                    ErrorKind::Io,
                    format!("failed to start editor {}", program),
                    e,
                )
            })?;
        debug!(editor = %program, note = %display_name, "editor started");

        let (stop_tx, stop_rx) = oneshot::channel();
        lock(&self.running).insert(path.to_path_buf(), stop_tx);

        let events = self.events.clone();
        let path = path.to_path_buf();
        runtime.spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_rx => None,
            };
            match exited {
                Some(Ok(status)) if !status.success() => {
                    warn!(%status, "editor exited with failure")
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!("failed waiting for editor: {}", e),
                None => {
                    let _ = child.kill().await;
                }
            }
            let _ = events.send(SurfaceEvent::Closed(path));
        });
        Ok(())
    }

    fn close(&self, path: &Path) {
        if let Some(stop) = lock(&self.running).remove(path) {
            let _ = stop.send(());
        }
    }

    fn has_unsaved_edits(&self, _path: &Path) -> bool {
        false
    }
}

fn editor_error(msg: &str) -> NotesealError {
    NotesealError::with_kind(ErrorCategory::Operational, ErrorKind::Io, msg)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
