//! Passphrase sources for unlocking a protected private key

use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use std::io::{self, IsTerminal, Read, Write};
use zeroize::Zeroizing;

/// Something that can ask the user for a passphrase.
///
/// `Ok(None)` means the user declined to answer; the caller treats that as
/// "stay locked", not as an error.
pub trait PassphrasePrompt: Send {
    /// Ask for a passphrase as arbitrary bytes (not necessarily UTF-8).
    ///
    /// The result is wrapped in `Zeroizing` so it is wiped from memory
    /// when dropped.
    fn prompt(&mut self, message: &str) -> Result<Option<Zeroizing<Vec<u8>>>>;
}

/// Always answers with the same passphrase.
pub struct FixedPassphrase {
    passphrase: Zeroizing<Vec<u8>>,
}

impl FixedPassphrase {
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }
}

impl PassphrasePrompt for FixedPassphrase {
    fn prompt(&mut self, _message: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(Some(self.passphrase.clone()))
    }
}

/// Never answers. For non-interactive sessions with unprotected keys.
pub struct DeclinePassphrase;

impl PassphrasePrompt for DeclinePassphrase {
    fn prompt(&mut self, _message: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(None)
    }
}

/// Reads the passphrase once from any `io::Read` source (e.g. stdin).
///
/// The whole stream is the passphrase, byte for byte. Later prompts get
/// the same value without reading again.
pub struct ReaderPassphrase {
    reader: Box<dyn Read + Send>,
    cached: Option<Zeroizing<Vec<u8>>>,
}

impl ReaderPassphrase {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            cached: None,
        }
    }
}

impl PassphrasePrompt for ReaderPassphrase {
    fn prompt(&mut self, _message: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if let Some(cached) = &self.cached {
            return Ok(Some(cached.clone()));
        }
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Authentication,
                ErrorKind::PassphraseUnavailable,
                format!("error reading passphrase: {}", e),
                e,
            )
        })?;
        self.cached = Some(data.clone());
        Ok(Some(data))
    }
}

/// Prompts on the terminal with no echo. An empty answer declines.
#[derive(Default)]
pub struct TerminalPassphrase;

impl TerminalPassphrase {
    pub fn new() -> Self {
        Self
    }
}

impl PassphrasePrompt for TerminalPassphrase {
    /// Note: terminal input is limited to UTF-8 due to rpassword library constraints.
    /// For non-UTF-8 passphrases, use --passphrase-stdin instead.
    fn prompt(&mut self, message: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if !io::stdin().is_terminal() {
            return Err(NotesealError::with_kind(
                ErrorCategory::Authentication,
                ErrorKind::PassphraseUnavailable,
                "cannot read passphrase from terminal - stdin is not a terminal",
            ));
        }

        let mut stderr = io::stderr();
        stderr
            .write_all(format!("{}: ", message).as_bytes())
            .and_then(|_| stderr.flush())
            .map_err(|e| {
                NotesealError::with_kind_and_source(
                    ErrorCategory::Operational,
                    ErrorKind::Io,
                    format!("failed to write prompt: {}", e),
                    e,
                )
            })?;

        // Note: rpassword returns String (UTF-8 only), not zeroized
        let passphrase = Zeroizing::new(rpassword::read_password().map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Authentication,
                ErrorKind::PassphraseUnavailable,
                format!("failure reading passphrase: {}", e),
                e,
            )
        })?);

        if passphrase.is_empty() {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(passphrase.as_bytes().to_vec())))
    }
}
