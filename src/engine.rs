//! Hybrid encryption engine
//!
//! Each note gets a fresh 256-bit content key. The content is sealed with
//! AES-256-GCM, the content key is wrapped with RSA-OAEP (SHA-256) under
//! the user's public key, and an HMAC-SHA256 over the ciphertext (keyed by
//! the content key) lets a reader detect tampering before touching the
//! cipher.
//!
//! Key material is held by a [`Session`]. The session auto-locks after a
//! period of inactivity when a tokio runtime is available.

use crate::envelope::{self, CURRENT_VERSION, EncryptedEnvelope, HMAC_VERSION};
use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use crate::fsutil;
use crate::keys::{self, KeyPairPaths};
use crate::passphrase::PassphrasePrompt;
use crate::session::{Session, SessionState};
use aes_gcm::aead::{self, AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// AES-256 key length in bytes.
pub const CONTENT_KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;
/// AES-GCM tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Default inactivity period before the session locks itself.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Where the engine finds its keys and how long a session stays unlocked.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub public_key_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    /// `None` or zero disables auto-lock.
    pub session_timeout: Option<Duration>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            private_key_path: None,
            session_timeout: Some(DEFAULT_SESSION_TIMEOUT),
        }
    }
}

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Work that must finish before key material is discarded.
///
/// Hooks are held weakly; dropping the owner unregisters them.
pub trait LockHook: Send + Sync {
    fn before_lock(&self) -> HookFuture<'_>;
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct HybridEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: KeyConfig,
    session: Session,
    hooks: Mutex<Vec<Weak<dyn LockHook>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timer.take() {
            timer.abort();
        }
    }
}

impl HybridEngine {
    pub fn new(config: KeyConfig) -> Self {
        let session = Session::new(config.session_timeout);
        Self {
            inner: Arc::new(EngineInner {
                config,
                session,
                hooks: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &KeyConfig {
        &self.inner.config
    }

    /// Generate a 4096-bit key pair into `output_dir`. See [`keys::generate_key_pair`].
    pub fn generate_key_pair(output_dir: &Path, passphrase: Option<&[u8]>) -> Result<KeyPairPaths> {
        keys::generate_key_pair(output_dir, passphrase)
    }

    /// Load the configured public key. Enough for [`encrypt`](Self::encrypt).
    pub fn load_public_key(&self) -> Result<()> {
        let key = keys::load_public_key(self.inner.config.public_key_path.as_deref())?;
        self.inner.session.install_public(key);
        debug!("public key loaded");
        Ok(())
    }

    /// Load the configured private key, decrypting it with `passphrase` if
    /// it is protected.
    pub fn load_private_key(&self, passphrase: Option<&[u8]>) -> Result<()> {
        let key =
            keys::load_private_key(self.inner.config.private_key_path.as_deref(), passphrase)?;
        self.inner.session.install_private(key);
        debug!("private key loaded");
        Ok(())
    }

    /// Load both keys and start the session.
    ///
    /// The passphrase source is consulted only if the private key is
    /// protected. Returns `Ok(false)` when the user declines to answer. On
    /// any failure the session stays locked.
    pub fn unlock(&self, prompt: &mut dyn PassphrasePrompt) -> Result<bool> {
        if self.is_unlocked() {
            self.inner.session.touch();
            return Ok(true);
        }

        match self.try_unlock(prompt) {
            Ok(true) => {
                self.inner.session.touch();
                self.arm_auto_lock();
                info!("session unlocked");
                Ok(true)
            }
            Ok(false) => {
                self.inner.session.clear();
                info!("unlock cancelled");
                Ok(false)
            }
            Err(e) => {
                self.inner.session.clear();
                warn!(kind = ?e.kind, "unlock failed");
                Err(e)
            }
        }
    }

    fn try_unlock(&self, prompt: &mut dyn PassphrasePrompt) -> Result<bool> {
        self.load_public_key()?;
        match self.load_private_key(None) {
            Ok(()) => Ok(true),
            Err(e) if e.is(ErrorKind::PassphraseRequired) => {
                let Some(passphrase) = prompt.prompt("Passphrase for private key")? else {
                    return Ok(false);
                };
                self.load_private_key(Some(&passphrase))?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Run every registered lock hook, then discard all key material.
    ///
    /// Waits for in-flight crypto operations. Locking a locked session is a
    /// no-op apart from running the hooks.
    pub async fn lock(&self) {
        self.cancel_auto_lock();
        self.run_lock_hooks().await;
        self.inner.session.clear();
        info!("session locked");
    }

    async fn run_lock_hooks(&self) {
        let hooks: Vec<Arc<dyn LockHook>> = {
            let mut hooks = self.hooks();
            hooks.retain(|hook| hook.strong_count() > 0);
            hooks.iter().filter_map(Weak::upgrade).collect()
        };
        for hook in hooks {
            hook.before_lock().await;
        }
    }

    /// Register work to run before every lock.
    pub fn register_lock_hook(&self, hook: Weak<dyn LockHook>) {
        self.hooks().push(hook);
    }

    pub fn is_unlocked(&self) -> bool {
        self.inner.session.is_unlocked()
    }

    pub fn status(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Seal `plaintext` into a current-version envelope. Needs the public key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let envelope = self
            .inner
            .session
            .with_public(|public| seal(public, plaintext))?;
        self.inner.session.touch();
        debug!(bytes = plaintext.len(), "sealed content");
        Ok(envelope)
    }

    /// Open an envelope of any supported version. Needs the private key.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = self
            .inner
            .session
            .with_private(|private| open(private, envelope))?;
        self.inner.session.touch();
        debug!(version = envelope.version, bytes = plaintext.len(), "opened envelope");
        Ok(plaintext)
    }

    /// Encrypt the file at `input` and write the envelope to `output`.
    pub fn encrypt_file(&self, input: &Path, output: &Path) -> Result<()> {
        let plaintext = Zeroizing::new(fsutil::read(input)?);
        self.write_envelope(output, &plaintext)
    }

    /// Encrypt `plaintext` and atomically replace `output` with the envelope.
    pub fn write_envelope(&self, output: &Path, plaintext: &[u8]) -> Result<()> {
        let envelope = self.encrypt(plaintext)?;
        fsutil::replace_atomic(output, envelope.to_json()?.as_bytes())
    }

    /// Read and open the envelope at `input`.
    pub fn decrypt_file(&self, input: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let data = fsutil::read(input)?;
        let envelope = EncryptedEnvelope::from_json(&data)
            .map_err(|e| e.with_context(format!("failed to read {}", input.display())))?;
        self.decrypt(&envelope)
    }

    /// True when `path` has the encrypted suffix and parses as an envelope.
    /// Never fails; unreadable files are simply not encrypted notes.
    pub fn is_encrypted_file(path: &Path) -> bool {
        if !envelope::has_encrypted_suffix(path) {
            return false;
        }
        match std::fs::read(path) {
            Ok(data) => envelope::looks_like_envelope(&data),
            Err(_) => false,
        }
    }

    fn arm_auto_lock(&self) {
        let Some(timeout) = self.inner.session.timeout() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; auto-lock disabled");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            loop {
                let remaining = match weak.upgrade() {
                    Some(inner) => timeout.saturating_sub(inner.session.idle_for()),
                    None => return,
                };
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(remaining).await;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach ourselves so lock() does not abort this task mid-flight.
            let _ = inner.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
            info!(?timeout, "session idle; locking");
            HybridEngine { inner }.lock().await;
        });

        if let Some(previous) = self.timer().replace(task) {
            previous.abort();
        }
    }

    fn cancel_auto_lock(&self) {
        if let Some(timer) = self.timer().take() {
            timer.abort();
        }
    }

    fn hooks(&self) -> std::sync::MutexGuard<'_, Vec<Weak<dyn LockHook>>> {
        self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn seal(public: &RsaPublicKey, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
    let mut content_key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
    OsRng.fill_bytes(&mut *content_key);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(&*content_key).map_err(|_| {
        NotesealError::with_kind(
            ErrorCategory::Operational,
            ErrorKind::InternalInvariant,
            "content key has the wrong length",
        )
    })?;
    let mut content = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(aead::Nonce::<Aes256Gcm>::from_slice(&iv), b"", &mut content)
        .map_err(|_| encryption_failed("content encryption failed"))?;

    let encrypted_key = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &*content_key)
        .map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Operational,
                ErrorKind::EncryptionFailed,
                "failed to wrap content key",
                e,
            )
        })?;

    let hmac = content_mac(&*content_key, &content)?
        .finalize()
        .into_bytes()
        .to_vec();

    Ok(EncryptedEnvelope {
        version: CURRENT_VERSION,
        encrypted_key,
        iv: iv.to_vec(),
        auth_tag: tag.to_vec(),
        content,
        hmac: Some(hmac),
        extra: Default::default(),
    })
}

fn open(private: &RsaPrivateKey, envelope: &EncryptedEnvelope) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.iv.len() != IV_LEN {
        return Err(decryption_failed("envelope has an invalid iv length"));
    }
    if envelope.auth_tag.len() != TAG_LEN {
        return Err(decryption_failed("envelope has an invalid tag length"));
    }

    let content_key = Zeroizing::new(
        private
            .decrypt(Oaep::new::<Sha256>(), &envelope.encrypted_key)
            .map_err(|e| {
                NotesealError::with_kind_and_source(
                    ErrorCategory::Integrity,
                    ErrorKind::DecryptionFailed,
                    "failed to unwrap content key (wrong key or corrupted file)",
                    e,
                )
            })?,
    );
    if content_key.len() != CONTENT_KEY_LEN {
        return Err(decryption_failed("unwrapped content key has the wrong length"));
    }

    match &envelope.hmac {
        Some(expected) => content_mac(&content_key, &envelope.content)?
            .verify_slice(expected)
            .map_err(|_| integrity_failed("content HMAC does not match"))?,
        // A missing HMAC on a version that requires one is a stripped tag.
        None if envelope.version >= HMAC_VERSION => {
            return Err(integrity_failed("envelope is missing its HMAC"));
        }
        None => {}
    }

    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|_| decryption_failed("unwrapped content key has the wrong length"))?;
    let mut plaintext = Zeroizing::new(envelope.content.clone());
    cipher
        .decrypt_in_place_detached(
            aead::Nonce::<Aes256Gcm>::from_slice(&envelope.iv),
            b"",
            &mut plaintext,
            aead::Tag::<Aes256Gcm>::from_slice(&envelope.auth_tag),
        )
        .map_err(|_| decryption_failed("authentication tag mismatch (corrupted or tampered file)"))?;
    Ok(plaintext)
}

fn content_mac(key: &[u8], content: &[u8]) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
        NotesealError::with_kind(
            ErrorCategory::Operational,
            ErrorKind::InternalInvariant,
            "invalid HMAC key length",
        )
    })?;
    mac.update(content);
    Ok(mac)
}

fn encryption_failed(msg: &str) -> NotesealError {
    NotesealError::with_kind(ErrorCategory::Operational, ErrorKind::EncryptionFailed, msg)
}

fn decryption_failed(msg: &str) -> NotesealError {
    NotesealError::with_kind(ErrorCategory::Integrity, ErrorKind::DecryptionFailed, msg)
}

fn integrity_failed(msg: &str) -> NotesealError {
    NotesealError::with_kind(ErrorCategory::Integrity, ErrorKind::IntegrityCheckFailed, msg)
}
