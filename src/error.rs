use std::error::Error as StdError;

use thiserror::Error;

/// Broad classes of failure. Each implies a different response from the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Keys are not configured, missing, or stored with lax permissions.
    Configuration,

    /// A passphrase was wrong or could not be obtained.
    Authentication,

    /// Stored data failed its integrity check and appears tampered with.
    Integrity,

    /// Cipher, I/O or other runtime failures. Also the catch-all for
    /// anything that cannot be confidently attributed to another category.
    Operational,

    /// A path attempted to escape the session storage directory.
    SecurityBoundary,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A key path is unset or the file does not exist.
    KeyNotFound,
    /// The private key file is readable by users other than its owner.
    InsecureKeyPermissions,
    /// Key material could not be parsed.
    InvalidKey,
    /// The private key is passphrase-protected and no passphrase was given.
    PassphraseRequired,
    /// The supplied passphrase does not open the private key.
    InvalidPassphrase,
    /// Passphrase could not be obtained from the configured prompt.
    PassphraseUnavailable,
    /// A crypto operation was attempted while the session is locked.
    NotUnlocked,
    /// The envelope HMAC did not match its content.
    IntegrityCheckFailed,
    /// Key unwrapping or authenticated decryption failed.
    DecryptionFailed,
    /// Authenticated encryption or key wrapping failed.
    EncryptionFailed,
    /// The envelope is not valid JSON or lacks required fields.
    EnvelopeMalformed,
    /// The envelope claims a version newer than this build understands.
    EnvelopeFromFuture,
    /// A path resolved outside the session storage directory.
    PathOutsideStorage,
    /// No usable temporary storage location could be prepared.
    StorageUnavailable,
    /// The settings file could not be parsed.
    InvalidSettings,
    /// No open record exists for the given path.
    RecordNotFound,
    /// Interaction with the filesystem or another process failed.
    Io,
    /// Unexpected state reached within noteseal logic.
    InternalInvariant,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct NotesealError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl NotesealError {
    /// Creates a new error with a required category and display message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Shorthand for an I/O failure on a specific path.
    pub(crate) fn io(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::with_kind_and_source(
            ErrorCategory::Operational,
            ErrorKind::Io,
            format!("failed to {} {}", action, path.display()),
            source,
        )
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// True when the kind matches. Absent kinds never match.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == Some(kind)
    }

    /// Configuration and authentication failures leave the session locked and
    /// can be fixed by the user, after which the operation may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Configuration | ErrorCategory::Authentication
        )
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    ///
    /// Category and kind carry over unchanged, so an integrity or sandbox
    /// failure stays detectable however many layers of context are added.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, NotesealError>;
