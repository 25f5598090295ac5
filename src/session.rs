//! Unlocked key material and inactivity tracking
//!
//! The session is the only place key material lives. Crypto operations
//! borrow a key for their whole duration through a read guard, so a lock
//! (write guard) waits for in-flight operations instead of clearing keys
//! out from under them.

use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Snapshot of the session for display and decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub is_unlocked: bool,
    pub last_activity: Instant,
    /// `None` when auto-lock is disabled.
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct KeySlot {
    public: Option<RsaPublicKey>,
    // RsaPrivateKey zeroizes its limbs on drop.
    private: Option<RsaPrivateKey>,
}

pub struct Session {
    keys: RwLock<KeySlot>,
    last_activity: Mutex<Instant>,
    timeout: Option<Duration>,
}

impl Session {
    /// A locked session. A zero timeout disables auto-lock.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            keys: RwLock::new(KeySlot::default()),
            last_activity: Mutex::new(Instant::now()),
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            is_unlocked: self.is_unlocked(),
            last_activity: *self.activity(),
            timeout: self.timeout,
        }
    }

    /// Unlocked means the private key is held.
    pub fn is_unlocked(&self) -> bool {
        self.read_keys().private.is_some()
    }

    pub fn has_public_key(&self) -> bool {
        self.read_keys().public.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time since the last successful crypto operation or unlock.
    pub fn idle_for(&self) -> Duration {
        self.activity().elapsed()
    }

    pub fn touch(&self) {
        *self.activity() = Instant::now();
    }

    pub(crate) fn install_public(&self, key: RsaPublicKey) {
        self.write_keys().public = Some(key);
    }

    pub(crate) fn install_private(&self, key: RsaPrivateKey) {
        self.write_keys().private = Some(key);
    }

    /// Drop all key material. Waits for in-flight operations to finish.
    pub(crate) fn clear(&self) {
        let mut keys = self.write_keys();
        keys.private = None;
        keys.public = None;
    }

    /// Run `f` with the public key held for its whole duration.
    pub(crate) fn with_public<T>(&self, f: impl FnOnce(&RsaPublicKey) -> Result<T>) -> Result<T> {
        let keys = self.read_keys();
        let key = keys.public.as_ref().ok_or_else(not_unlocked)?;
        f(key)
    }

    /// Run `f` with the private key held for its whole duration.
    pub(crate) fn with_private<T>(
        &self,
        f: impl FnOnce(&RsaPrivateKey) -> Result<T>,
    ) -> Result<T> {
        let keys = self.read_keys();
        let key = keys.private.as_ref().ok_or_else(not_unlocked)?;
        f(key)
    }

    // A panic while holding a guard cannot leave the slot half-written
    // (every write is a single assignment), so poisoning is ignored.
    fn read_keys(&self) -> std::sync::RwLockReadGuard<'_, KeySlot> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_keys(&self) -> std::sync::RwLockWriteGuard<'_, KeySlot> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_unlocked() -> NotesealError {
    NotesealError::with_kind(
        ErrorCategory::Configuration,
        ErrorKind::NotUnlocked,
        "session is locked; unlock it first",
    )
}
