//! Plaintext lifecycle manager
//!
//! Binds each open encrypted note to exactly one plaintext copy inside the
//! session storage directory, re-encrypts that copy as it changes, and
//! destroys it on every exit path: close, move, delete, lock, dispose.
//!
//! Per record, re-encryption follows a small state machine:
//!
//! ```text
//! Idle -> Scheduled -> Encrypting -> Idle
//!                          |
//!                          +-> Scheduled   (edited while encrypting)
//! ```
//!
//! Edits are counted. A re-encryption persists every edit counted before it
//! read the plaintext, so the envelope never goes backwards. At most one
//! re-encryption per record runs at a time (the record's encrypt gate).
//! Erasure takes the same gate after a final forced re-encryption, so no
//! plaintext is destroyed before the last edit is durably sealed.

use crate::engine::{HookFuture, HybridEngine, LockHook};
use crate::envelope;
use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use crate::passphrase::PassphrasePrompt;
use crate::storage::{SessionStorage, StorageInfo, canonicalize_lenient};
use crate::surface::{EditingSurface, SurfaceEvent};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Default quiet period before a change is re-encrypted.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default polling period of the change watch.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Hex digits of the path hash used for a record's directory name.
const RECORD_DIR_HEX_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub debounce: Duration,
    /// Polling period of the per-record change watch. `None` disables the
    /// watch; changes then arrive only through [`SurfaceEvent`]s.
    pub watch_interval: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            watch_interval: Some(DEFAULT_WATCH_INTERVAL),
        }
    }
}

/// Public view of an open note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempFileRecord {
    pub temporary_path: PathBuf,
    pub encrypted_path: PathBuf,
    pub last_modified: Option<SystemTime>,
    /// Whether a change watch task is running for this record.
    pub watched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushPhase {
    Idle,
    Scheduled,
    Encrypting,
}

struct Tracker {
    phase: FlushPhase,
    /// Change notifications received.
    edits: u64,
    /// Highest edit count known to be sealed on disk.
    persisted: u64,
    /// Identifies the newest debounce timer; older timers do nothing.
    timer_seq: u64,
    fingerprint: Option<(SystemTime, u64)>,
    last_modified: Option<SystemTime>,
    closed: bool,
}

impl Tracker {
    fn is_dirty(&self) -> bool {
        self.edits > self.persisted || self.phase != FlushPhase::Idle
    }
}

struct Record {
    temporary_path: PathBuf,
    encrypted_path: PathBuf,
    display_name: String,
    tracker: Mutex<Tracker>,
    encrypt_gate: tokio::sync::Mutex<()>,
    watch: Mutex<Option<JoinHandle<()>>>,
}

impl Record {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        lock(&self.tracker)
    }

    fn snapshot(&self) -> TempFileRecord {
        TempFileRecord {
            temporary_path: self.temporary_path.clone(),
            encrypted_path: self.encrypted_path.clone(),
            last_modified: self.tracker().last_modified,
            watched: lock(&self.watch).is_some(),
        }
    }

    fn stop_watch(&self) {
        if let Some(watch) = lock(&self.watch).take() {
            watch.abort();
        }
    }
}

#[derive(Default)]
struct Records {
    by_temporary: HashMap<PathBuf, Arc<Record>>,
    by_encrypted: HashMap<PathBuf, PathBuf>,
}

/// Cheap to clone; clones share the same records.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    engine: HybridEngine,
    storage: SessionStorage,
    surface: Arc<dyn EditingSurface>,
    prompt: Mutex<Box<dyn PassphrasePrompt>>,
    config: LifecycleConfig,
    records: Mutex<Records>,
    /// Serializes open, create, close, move handling, lock and dispose.
    ops: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    lock_hook: Arc<EraseOnLock>,
}

/// Flushes and erases every record before the engine drops its keys.
struct EraseOnLock {
    manager: Weak<ManagerInner>,
}

impl LockHook for EraseOnLock {
    fn before_lock(&self) -> HookFuture<'_> {
        Box::pin(async move {
            if let Some(inner) = self.manager.upgrade() {
                LifecycleManager { inner }.close_all("session lock").await;
            }
        })
    }
}

impl LifecycleManager {
    pub fn new(
        engine: HybridEngine,
        storage: SessionStorage,
        surface: Arc<dyn EditingSurface>,
        prompt: Box<dyn PassphrasePrompt>,
        config: LifecycleConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| ManagerInner {
            engine,
            storage,
            surface,
            prompt: Mutex::new(prompt),
            config,
            records: Mutex::new(Records::default()),
            ops: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            lock_hook: Arc::new(EraseOnLock {
                manager: weak.clone(),
            }),
        });
        let hook = Arc::downgrade(&inner.lock_hook) as Weak<dyn LockHook>;
        inner.engine.register_lock_hook(hook);
        Self { inner }
    }

    pub fn engine(&self) -> &HybridEngine {
        &self.inner.engine
    }

    pub fn storage_info(&self) -> StorageInfo {
        self.inner.storage.storage_info()
    }

    pub fn storage_path(&self) -> &Path {
        self.inner.storage.base_path()
    }

    /// Open an encrypted note for editing and return its plaintext path.
    ///
    /// A note that is already open is shown again at its existing path. On
    /// any failure no record is left behind.
    pub async fn open(&self, encrypted_path: &Path) -> Result<PathBuf> {
        let _ops = self.inner.ops.lock().await;
        self.open_locked(encrypted_path).await
    }

    /// Create a new encrypted note with `initial` content and open it.
    pub async fn create(&self, encrypted_path: &Path, initial: &[u8]) -> Result<PathBuf> {
        let _ops = self.inner.ops.lock().await;
        self.ensure_active()?;
        if encrypted_path.exists() {
            return Err(NotesealError::with_kind(
                ErrorCategory::Operational,
                ErrorKind::Io,
                format!("{} already exists", encrypted_path.display()),
            ));
        }
        self.ensure_unlocked()?;

        let engine = self.inner.engine.clone();
        let target = encrypted_path.to_path_buf();
        let initial = Zeroizing::new(initial.to_vec());
        run_blocking(move || engine.write_envelope(&target, &initial)).await?;
        info!(path = %encrypted_path.display(), "note created");

        self.open_locked(encrypted_path).await
    }

    async fn open_locked(&self, encrypted_path: &Path) -> Result<PathBuf> {
        self.ensure_active()?;
        let encrypted_path = record_key(encrypted_path);
        let display_name = envelope::display_name(&encrypted_path);

        if let Some(record) = self.find_encrypted(&encrypted_path) {
            self.inner.surface.show(&record.temporary_path, &display_name)?;
            debug!(path = %encrypted_path.display(), "note already open");
            return Ok(record.temporary_path.clone());
        }

        self.ensure_unlocked()?;
        let engine = self.inner.engine.clone();
        let source = encrypted_path.clone();
        let plaintext = run_blocking(move || engine.decrypt_file(&source)).await?;

        let storage = &self.inner.storage;
        let record_dir = storage.create_dir(Path::new(&record_dir_name(
            &encrypted_path,
            &display_name,
        )))?;
        let temporary_path = storage.write(&record_dir.join(&display_name), &plaintext)?;
        drop(plaintext);
        let fingerprint = storage.fingerprint(&temporary_path).unwrap_or(None);

        let record = Arc::new(Record {
            temporary_path: temporary_path.clone(),
            encrypted_path: encrypted_path.clone(),
            display_name: display_name.clone(),
            tracker: Mutex::new(Tracker {
                phase: FlushPhase::Idle,
                edits: 0,
                persisted: 0,
                timer_seq: 0,
                fingerprint,
                last_modified: fingerprint.map(|(modified, _)| modified),
                closed: false,
            }),
            encrypt_gate: tokio::sync::Mutex::new(()),
            watch: Mutex::new(None),
        });

        if let Err(e) = self.inner.surface.show(&temporary_path, &display_name) {
            if let Err(erase) = storage.secure_erase(&temporary_path) {
                error!(path = %temporary_path.display(), "failed to erase plaintext: {}", erase);
            }
            return Err(e);
        }

        {
            let mut records = self.table();
            records
                .by_temporary
                .insert(temporary_path.clone(), Arc::clone(&record));
            records
                .by_encrypted
                .insert(encrypted_path.clone(), temporary_path.clone());
        }
        self.spawn_watch(&record);
        info!(
            path = %encrypted_path.display(),
            storage = %self.inner.storage.profile().security_level,
            "note opened"
        );
        Ok(temporary_path)
    }

    /// Route a notification from the editing surface.
    pub async fn handle_event(&self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::Changed(path) => self.notify_changed(&path),
            SurfaceEvent::Saved(path) => {
                if let Err(e) = self.save(&path).await {
                    error!(path = %path.display(), "save failed: {}", e);
                }
            }
            SurfaceEvent::Closed(path) => {
                if let Err(e) = self.close(&path).await {
                    error!(path = %path.display(), "close failed: {}", e);
                }
            }
        }
    }

    /// Record a change to a plaintext file and schedule a debounced
    /// re-encryption. Unknown paths are ignored.
    pub fn notify_changed(&self, temporary_path: &Path) {
        let Some(record) = self.find_temporary(temporary_path) else {
            debug!(path = %temporary_path.display(), "change for unknown file ignored");
            return;
        };
        let seq = {
            let mut tracker = record.tracker();
            if tracker.closed {
                return;
            }
            tracker.edits += 1;
            tracker.timer_seq += 1;
            tracker.last_modified = Some(SystemTime::now());
            if tracker.phase == FlushPhase::Idle {
                tracker.phase = FlushPhase::Scheduled;
            }
            tracker.timer_seq
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; change will be sealed on save or close");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.config.debounce;
        runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if record.tracker().timer_seq != seq {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = LifecycleManager { inner };
            if let Err(e) = manager.flush(&record, false).await {
                error!(
                    path = %record.encrypted_path.display(),
                    "re-encryption failed; plaintext kept for retry: {}", e
                );
            }
        });
    }

    /// Re-encrypt now, bypassing the debounce. Also the retry path after a
    /// failed scheduled re-encryption.
    pub async fn save(&self, temporary_path: &Path) -> Result<()> {
        let record = self.require_temporary(temporary_path)?;
        self.flush(&record, true).await.map(|_| ())
    }

    /// Flush the last edit, then erase the plaintext and drop the record.
    ///
    /// If the flush fails the plaintext and record stay in place.
    pub async fn close(&self, temporary_path: &Path) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let record = self.require_temporary(temporary_path)?;
        self.flush_and_erase(&record, true).await?;
        info!(path = %record.encrypted_path.display(), "note closed");
        Ok(())
    }

    /// The encrypted file was moved, renamed or deleted behind our back.
    ///
    /// The surface is closed, then the record is flushed and erased. A
    /// deleted note with no pending edits is not recreated; pending edits
    /// are written back to the original path rather than lost.
    pub async fn on_file_moved_or_deleted(&self, encrypted_path: &Path) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let Some(record) = self.find_encrypted(&record_key(encrypted_path)) else {
            return Ok(());
        };
        self.inner.surface.close(&record.temporary_path);

        let gone = !record.encrypted_path.exists();
        let dirty = record.tracker().is_dirty();
        if gone && dirty {
            warn!(
                path = %record.encrypted_path.display(),
                "note vanished with unsaved edits; writing them back"
            );
        }
        self.flush_and_erase(&record, !gone || dirty).await
    }

    /// Flush and close a note ahead of a move. Returns false if the flush
    /// failed; the caller must then abort the move. The note stays open in
    /// that case.
    pub async fn save_and_close_before_move(&self, encrypted_path: &Path) -> bool {
        let _ops = self.inner.ops.lock().await;
        let Some(record) = self.find_encrypted(&record_key(encrypted_path)) else {
            return true;
        };

        let gate = record.encrypt_gate.lock().await;
        if let Err(e) = self.flush_locked(&record, true).await {
            warn!(path = %record.encrypted_path.display(), "flush before move failed: {}", e);
            return false;
        }
        self.inner.surface.close(&record.temporary_path);
        let erased = self.erase_locked(&record);
        drop(gate);
        match erased {
            Ok(()) => true,
            Err(e) => {
                error!(path = %record.temporary_path.display(), "erase failed: {}", e);
                // Edits are sealed, so the move itself is safe.
                true
            }
        }
    }

    /// Whether a destructive action on this note needs confirmation.
    pub fn is_open_with_unsaved_changes(&self, encrypted_path: &Path) -> bool {
        let Some(record) = self.find_encrypted(&record_key(encrypted_path)) else {
            return false;
        };
        record.tracker().is_dirty() || self.inner.surface.has_unsaved_edits(&record.temporary_path)
    }

    pub fn record(&self, encrypted_path: &Path) -> Option<TempFileRecord> {
        self.find_encrypted(&record_key(encrypted_path))
            .map(|record| record.snapshot())
    }

    pub fn records(&self) -> Vec<TempFileRecord> {
        self.table()
            .by_temporary
            .values()
            .map(|record| record.snapshot())
            .collect()
    }

    /// Flush and erase every record, then remove the session storage.
    ///
    /// If any flush fails, its record and the storage directory are kept
    /// and the error is returned; calling again retries.
    pub async fn dispose(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(e) = self.close_all_locked("dispose").await {
            return Err(e.with_context("dispose aborted to keep unsaved edits"));
        }
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.storage.remove()?;
        info!("lifecycle manager disposed");
        Ok(())
    }

    async fn close_all(&self, reason: &str) {
        let _ops = self.inner.ops.lock().await;
        if let Some(e) = self.close_all_locked(reason).await {
            error!(reason, "notes left open: {}", e);
        }
    }

    async fn close_all_locked(&self, reason: &str) -> Option<NotesealError> {
        let records: Vec<Arc<Record>> = self.table().by_temporary.values().cloned().collect();
        let mut first_error = None;
        for record in records {
            self.inner.surface.close(&record.temporary_path);
            if let Err(e) = self.flush_and_erase(&record, true).await {
                error!(
                    path = %record.encrypted_path.display(),
                    reason,
                    "could not flush note; plaintext kept: {}", e
                );
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    async fn flush(&self, record: &Arc<Record>, force: bool) -> Result<bool> {
        let _gate = record.encrypt_gate.lock().await;
        self.flush_locked(record, force).await
    }

    /// Re-encrypt the plaintext into the envelope. The caller holds the
    /// record's encrypt gate. Returns whether anything was written.
    async fn flush_locked(&self, record: &Arc<Record>, force: bool) -> Result<bool> {
        let target = {
            let mut tracker = record.tracker();
            if tracker.closed {
                return Ok(false);
            }
            if !force && tracker.edits <= tracker.persisted {
                tracker.phase = FlushPhase::Idle;
                return Ok(false);
            }
            tracker.phase = FlushPhase::Encrypting;
            tracker.edits
        };

        let result = self.seal_plaintext(record).await;

        let mut tracker = record.tracker();
        match result {
            Ok(()) => {
                tracker.persisted = tracker.persisted.max(target);
                tracker.phase = if tracker.edits > tracker.persisted {
                    FlushPhase::Scheduled
                } else {
                    FlushPhase::Idle
                };
                debug!(path = %record.encrypted_path.display(), edit = target, "note re-encrypted");
                Ok(true)
            }
            Err(e) => {
                // Keep the edit counted as unpersisted so a retry picks it up.
                tracker.phase = FlushPhase::Idle;
                if tracker.edits == tracker.persisted {
                    tracker.edits += 1;
                }
                Err(e)
            }
        }
    }

    async fn seal_plaintext(&self, record: &Record) -> Result<()> {
        let plaintext = self.inner.storage.read(&record.temporary_path)?;
        let engine = self.inner.engine.clone();
        let target = record.encrypted_path.clone();
        run_blocking(move || engine.write_envelope(&target, &plaintext))
            .await
            .map_err(|e| e.with_context(format!("failed to re-encrypt {}", record.display_name)))
    }

    async fn flush_and_erase(&self, record: &Arc<Record>, flush: bool) -> Result<()> {
        let _gate = record.encrypt_gate.lock().await;
        if flush {
            self.flush_locked(record, true).await?;
        }
        self.erase_locked(record)
    }

    /// Erase the plaintext and forget the record. The caller holds the
    /// record's encrypt gate.
    fn erase_locked(&self, record: &Record) -> Result<()> {
        record.tracker().closed = true;
        record.stop_watch();
        {
            let mut records = self.table();
            records.by_temporary.remove(&record.temporary_path);
            records.by_encrypted.remove(&record.encrypted_path);
        }
        self.inner.storage.secure_erase(&record.temporary_path)
    }

    fn spawn_watch(&self, record: &Arc<Record>) {
        let Some(period) = self.inner.config.watch_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(record);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(inner), Some(record)) = (weak.upgrade(), watched.upgrade()) else {
                    return;
                };
                let current = match inner.storage.fingerprint(&record.temporary_path) {
                    Ok(Some(current)) => current,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("change watch stopped: {}", e);
                        return;
                    }
                };
                let changed = {
                    let mut tracker = record.tracker();
                    let changed = tracker.fingerprint != Some(current);
                    tracker.fingerprint = Some(current);
                    changed
                };
                if changed {
                    LifecycleManager { inner }.notify_changed(&record.temporary_path);
                }
            }
        });
        *lock(&record.watch) = Some(task);
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.inner.engine.is_unlocked() {
            return Ok(());
        }
        let mut prompt = lock(&self.inner.prompt);
        if self.inner.engine.unlock(&mut **prompt)? {
            Ok(())
        } else {
            Err(NotesealError::with_kind(
                ErrorCategory::Authentication,
                ErrorKind::NotUnlocked,
                "unlock cancelled",
            ))
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(NotesealError::with_kind(
                ErrorCategory::Operational,
                ErrorKind::StorageUnavailable,
                "lifecycle manager has been disposed",
            ));
        }
        Ok(())
    }

    fn find_encrypted(&self, encrypted_path: &Path) -> Option<Arc<Record>> {
        let records = self.table();
        let temporary = records.by_encrypted.get(encrypted_path)?;
        records.by_temporary.get(temporary).cloned()
    }

    fn find_temporary(&self, temporary_path: &Path) -> Option<Arc<Record>> {
        self.table().by_temporary.get(temporary_path).cloned()
    }

    fn require_temporary(&self, temporary_path: &Path) -> Result<Arc<Record>> {
        self.find_temporary(temporary_path).ok_or_else(|| {
            NotesealError::with_kind(
                ErrorCategory::Operational,
                ErrorKind::RecordNotFound,
                format!("{} is not an open note", temporary_path.display()),
            )
        })
    }

    fn table(&self) -> MutexGuard<'_, Records> {
        lock(&self.inner.records)
    }
}

/// Canonical form of an encrypted path, tolerating a missing file.
fn record_key(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    canonicalize_lenient(&absolute).unwrap_or(absolute)
}

/// Directory name for a record: a stable hash of the note's path and name,
/// so reopening a note lands in the same place and unrelated notes with the
/// same name do not collide.
fn record_dir_name(encrypted_path: &Path, display_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encrypted_path.as_os_str().as_encoded_bytes());
    hasher.update(display_name.as_bytes());
    let mut name = hex::encode(hasher.finalize());
    name.truncate(RECORD_DIR_HEX_LEN);
    name
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        NotesealError::with_kind_and_source(
            ErrorCategory::Operational,
            ErrorKind::InternalInvariant,
            "crypto task did not complete",
            e,
        )
    })?
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KeyConfig;
    use crate::keys::test_support::{TEST_PASSPHRASE, write_key_pair};
    use crate::passphrase::{DeclinePassphrase, FixedPassphrase};
    use crate::storage::HostEnv;
    use crate::surface::HeadlessSurface;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        engine: HybridEngine,
        surface: Arc<HeadlessSurface>,
        manager: LifecycleManager,
    }

    impl Fixture {
        fn new(config: LifecycleConfig) -> Self {
            Self::build(config, false)
        }

        fn build(config: LifecycleConfig, protected: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let paths = write_key_pair(&dir.path().join("keys"), protected);
            let engine = HybridEngine::new(KeyConfig {
                public_key_path: Some(paths.public_key_path),
                private_key_path: Some(paths.private_key_path),
                session_timeout: None,
            });
            let storage_root = dir.path().join("ram");
            fs::create_dir(&storage_root).unwrap();
            let storage = SessionStorage::detect_with(&HostEnv {
                platform: crate::storage::Platform::Linux,
                ram_roots: vec![storage_root.clone()],
                user_temp: None,
                fallback_temp: storage_root,
            })
            .unwrap();
            fs::create_dir(dir.path().join("notes")).unwrap();

            let surface = Arc::new(HeadlessSurface::new());
            let prompt: Box<dyn PassphrasePrompt> = if protected {
                Box::new(FixedPassphrase::new(TEST_PASSPHRASE))
            } else {
                Box::new(DeclinePassphrase)
            };
            let manager = LifecycleManager::new(
                engine.clone(),
                storage,
                Arc::clone(&surface) as Arc<dyn EditingSurface>,
                prompt,
                config,
            );
            Self {
                dir,
                engine,
                surface,
                manager,
            }
        }

        fn note(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join("notes").join(name);
            let writer = self.engine.clone();
            writer.load_public_key().unwrap();
            writer.write_envelope(&path, content).unwrap();
            path
        }

        fn sealed(&self, path: &Path) -> Vec<u8> {
            self.engine.decrypt_file(path).unwrap().to_vec()
        }
    }

    fn slow_debounce() -> LifecycleConfig {
        LifecycleConfig {
            debounce: Duration::from_secs(30),
            watch_interval: None,
        }
    }

    #[tokio::test]
    async fn test_open_twice_reuses_record() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("journal.md.enc", b"dear diary");

        let first = fx.manager.open(&note).await.unwrap();
        let second = fx.manager.open(&note).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.manager.records().len(), 1);
        assert_eq!(fs::read(&first).unwrap(), b"dear diary");
        assert_eq!(first.file_name().unwrap(), "journal.md");
        assert!(first.starts_with(fx.manager.storage_path()));
        assert!(fx.surface.is_showing(&first));
    }

    #[tokio::test]
    async fn test_open_prompts_for_protected_key() {
        let fx = Fixture::build(slow_debounce(), true);
        let note = fx.note("a.md.enc", b"protected");
        assert!(!fx.engine.is_unlocked());

        let path = fx.manager.open(&note).await.unwrap();
        assert!(fx.engine.is_unlocked());
        assert_eq!(fs::read(path).unwrap(), b"protected");
    }

    #[tokio::test]
    async fn test_failed_decrypt_leaves_no_record() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.dir.path().join("notes").join("broken.md.enc");
        fs::write(&note, b"{\"version\": 2}").unwrap();

        let err = fx.manager.open(&note).await.unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::EnvelopeMalformed));
        assert!(fx.manager.records().is_empty());
    }

    #[tokio::test]
    async fn test_close_flushes_pending_edit_before_erase() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("todo.md.enc", b"v1");
        let plain = fx.manager.open(&note).await.unwrap();

        fs::write(&plain, b"v2").unwrap();
        fx.manager.notify_changed(&plain);
        fs::write(&plain, b"v3").unwrap();
        fx.manager.notify_changed(&plain);
        assert!(fx.manager.is_open_with_unsaved_changes(&note));

        fx.manager.close(&plain).await.unwrap();
        assert!(!plain.exists());
        assert!(fx.manager.records().is_empty());
        assert_eq!(fx.sealed(&note), b"v3");
    }

    #[tokio::test]
    async fn test_debounce_collapses_changes() {
        let fx = Fixture::new(LifecycleConfig {
            debounce: Duration::from_millis(50),
            watch_interval: None,
        });
        let note = fx.note("n.md.enc", b"start");
        let plain = fx.manager.open(&note).await.unwrap();
        let before = fs::read(&note).unwrap();

        for i in 0..5 {
            fs::write(&plain, format!("edit {}", i)).unwrap();
            fx.manager.notify_changed(&plain);
        }
        assert_eq!(fs::read(&note).unwrap(), before);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.sealed(&note), b"edit 4");
        assert!(!fx.manager.is_open_with_unsaved_changes(&note));
    }

    #[tokio::test]
    async fn test_change_during_reencryption_schedules_one_more() {
        let fx = Fixture::new(LifecycleConfig {
            debounce: Duration::from_millis(100),
            watch_interval: None,
        });
        let note = fx.note("busy.md.enc", b"start");
        let plain = fx.manager.open(&note).await.unwrap();
        let record = fx.manager.find_temporary(&plain).unwrap();

        fs::write(&plain, b"first").unwrap();
        fx.manager.notify_changed(&plain);
        let in_flight = {
            let manager = fx.manager.clone();
            let record = Arc::clone(&record);
            tokio::spawn(async move { manager.flush(&record, false).await })
        };
        while record.tracker().phase != FlushPhase::Encrypting {
            tokio::task::yield_now().await;
        }
        // The in-flight re-encryption holds the gate; nothing else can seal.
        assert!(record.encrypt_gate.try_lock().is_err());

        fs::write(&plain, b"second").unwrap();
        fx.manager.notify_changed(&plain);
        {
            let tracker = record.tracker();
            assert_eq!(tracker.phase, FlushPhase::Encrypting);
            assert_eq!(tracker.edits, 2);
        }

        assert!(in_flight.await.unwrap().unwrap());
        {
            let tracker = record.tracker();
            assert_eq!(tracker.phase, FlushPhase::Scheduled);
            assert_eq!(tracker.persisted, 1);
        }
        assert_eq!(fx.sealed(&note), b"first");
        assert!(fx.manager.is_open_with_unsaved_changes(&note));

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !fx.manager.is_open_with_unsaved_changes(&note) {
                break;
            }
        }
        assert_eq!(fx.sealed(&note), b"second");
        let tracker = record.tracker();
        assert_eq!(tracker.phase, FlushPhase::Idle);
        assert_eq!(tracker.persisted, 2);
        assert_eq!(tracker.edits, 2);
    }

    #[tokio::test]
    async fn test_saved_event_bypasses_debounce() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("s.md.enc", b"old");
        let plain = fx.manager.open(&note).await.unwrap();

        fs::write(&plain, b"new").unwrap();
        fx.manager.handle_event(SurfaceEvent::Saved(plain.clone())).await;
        assert_eq!(fx.sealed(&note), b"new");
    }

    #[tokio::test]
    async fn test_watch_picks_up_external_edits() {
        let fx = Fixture::new(LifecycleConfig {
            debounce: Duration::from_millis(20),
            watch_interval: Some(Duration::from_millis(20)),
        });
        let note = fx.note("w.md.enc", b"before");
        let plain = fx.manager.open(&note).await.unwrap();
        assert!(fx.manager.record(&note).unwrap().watched);

        // Different length so the fingerprint changes even on coarse clocks.
        fs::write(&plain, b"after the edit").unwrap();
        let mut sealed = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sealed = fx.sealed(&note);
            if sealed == b"after the edit" {
                break;
            }
        }
        assert_eq!(sealed, b"after the edit");
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_plaintext_for_retry() {
        let fx = Fixture::new(slow_debounce());
        let subdir = fx.dir.path().join("notes").join("sub");
        fs::create_dir(&subdir).unwrap();
        let note = subdir.join("keep.md.enc");
        let writer = fx.engine.clone();
        writer.load_public_key().unwrap();
        writer.write_envelope(&note, b"original").unwrap();

        let plain = fx.manager.open(&note).await.unwrap();
        fs::write(&plain, b"precious edit").unwrap();
        fx.manager.notify_changed(&plain);
        fs::remove_dir_all(&subdir).unwrap();

        assert!(fx.manager.save(&plain).await.is_err());
        assert!(fx.manager.close(&plain).await.is_err());
        assert!(!fx.manager.save_and_close_before_move(&note).await);
        assert_eq!(fs::read(&plain).unwrap(), b"precious edit");
        assert!(fx.manager.is_open_with_unsaved_changes(&note));

        fs::create_dir(&subdir).unwrap();
        fx.manager.save(&plain).await.unwrap();
        assert_eq!(fx.sealed(&note), b"precious edit");
        fx.manager.close(&plain).await.unwrap();
        assert!(!plain.exists());
    }

    #[tokio::test]
    async fn test_move_flushes_then_closes_surface() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("m.md.enc", b"one");
        let plain = fx.manager.open(&note).await.unwrap();

        fs::write(&plain, b"two").unwrap();
        fx.manager.notify_changed(&plain);
        assert!(fx.manager.save_and_close_before_move(&note).await);
        assert!(!fx.surface.is_showing(&plain));
        assert!(!plain.exists());
        assert_eq!(fx.sealed(&note), b"two");

        // Nothing open: trivially safe to move.
        assert!(fx.manager.save_and_close_before_move(&note).await);
    }

    #[tokio::test]
    async fn test_moved_away_note_is_flushed_and_erased() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("r.md.enc", b"one");
        let plain = fx.manager.open(&note).await.unwrap();
        fs::write(&plain, b"two").unwrap();
        fx.manager.notify_changed(&plain);

        fx.manager.on_file_moved_or_deleted(&note).await.unwrap();
        assert!(!fx.surface.is_showing(&plain));
        assert!(!plain.exists());
        assert_eq!(fx.sealed(&note), b"two");
    }

    #[tokio::test]
    async fn test_deleted_clean_note_is_not_recreated() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("d.md.enc", b"bye");
        let plain = fx.manager.open(&note).await.unwrap();

        fs::remove_file(&note).unwrap();
        fx.manager.on_file_moved_or_deleted(&note).await.unwrap();
        assert!(!plain.exists());
        assert!(!note.exists());
        assert!(fx.manager.records().is_empty());
    }

    #[tokio::test]
    async fn test_surface_dirty_counts_as_unsaved() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.note("u.md.enc", b"x");
        let plain = fx.manager.open(&note).await.unwrap();

        assert!(!fx.manager.is_open_with_unsaved_changes(&note));
        fx.surface.set_unsaved(&plain, true);
        assert!(fx.manager.is_open_with_unsaved_changes(&note));
    }

    #[tokio::test]
    async fn test_lock_flushes_and_erases_everything() {
        let fx = Fixture::new(slow_debounce());
        let a = fx.note("a.md.enc", b"a0");
        let b = fx.note("b.md.enc", b"b0");
        let plain_a = fx.manager.open(&a).await.unwrap();
        let plain_b = fx.manager.open(&b).await.unwrap();
        fs::write(&plain_a, b"a1").unwrap();
        fx.manager.notify_changed(&plain_a);

        fx.engine.lock().await;
        assert!(!fx.engine.is_unlocked());
        assert!(!plain_a.exists());
        assert!(!plain_b.exists());
        assert!(fx.manager.records().is_empty());
        assert!(fx.manager.storage_path().exists());

        assert!(fx.engine.unlock(&mut DeclinePassphrase).unwrap());
        assert_eq!(fx.sealed(&a), b"a1");
        assert_eq!(fx.sealed(&b), b"b0");
    }

    #[tokio::test]
    async fn test_create_then_dispose() {
        let fx = Fixture::new(slow_debounce());
        let note = fx.dir.path().join("notes").join("new.md.enc");

        let plain = fx.manager.create(&note, b"# New").await.unwrap();
        assert_eq!(fs::read(&plain).unwrap(), b"# New");
        assert!(fx.manager.create(&note, b"again").await.is_err());

        fs::write(&plain, b"# New\nbody").unwrap();
        fx.manager.notify_changed(&plain);
        let base = fx.manager.storage_path().to_path_buf();

        fx.manager.dispose().await.unwrap();
        assert!(!base.exists());
        assert_eq!(fx.sealed(&note), b"# New\nbody");
        let err = fx.manager.open(&note).await.unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::StorageUnavailable));
    }

    #[test]
    fn test_record_dir_name_is_stable() {
        let a = record_dir_name(Path::new("/notes/a.md.enc"), "a.md");
        assert_eq!(a, record_dir_name(Path::new("/notes/a.md.enc"), "a.md"));
        assert_eq!(a.len(), RECORD_DIR_HEX_LEN);
        assert_ne!(a, record_dir_name(Path::new("/other/a.md.enc"), "a.md"));
    }
}
