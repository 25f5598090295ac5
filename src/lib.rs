//! Noteseal - per-file hybrid encryption for notes
//!
//! Notes are sealed individually (RSA-OAEP key wrapping, AES-256-GCM,
//! HMAC-SHA256) and edited through a lifecycle manager that keeps exactly
//! one plaintext copy per open note in session storage and destroys it when
//! the note is closed, moved, deleted or the session locks.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod file_ops;
pub mod fsutil;
pub mod keys;
pub mod lifecycle;
pub mod passphrase;
pub mod session;
pub mod storage;
pub mod surface;

pub use engine::{HybridEngine, KeyConfig};
pub use envelope::EncryptedEnvelope;
pub use error::{ErrorCategory, ErrorKind, NotesealError, Result};
pub use lifecycle::{LifecycleConfig, LifecycleManager, TempFileRecord};
pub use storage::{SecurityLevel, SessionStorage, StorageInfo, StorageProfile};
