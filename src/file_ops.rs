//! One-shot file commands
//!
//! Encrypt, decrypt and update single files without going through the
//! editing lifecycle. Used by the `noteseal` binary.

use crate::engine::HybridEngine;
use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use crate::fsutil;
use crate::passphrase::PassphrasePrompt;
use std::path::Path;
use tracing::info;

/// Encrypt `input_path` into an envelope at `output_path`.
///
/// Only the public key is needed, so no passphrase is asked for. The output
/// is written atomically with mode 0o600 on Unix systems.
pub fn encrypt_file(engine: &HybridEngine, input_path: &Path, output_path: &Path) -> Result<()> {
    engine.load_public_key()?;
    engine
        .encrypt_file(input_path, output_path)
        .map_err(|e| e.with_context(format!("failed to encrypt {}", input_path.display())))?;
    info!(output = %output_path.display(), "file encrypted");
    Ok(())
}

/// Decrypt the envelope at `input_path` and write the plaintext to
/// `output_path` with mode 0o600 on Unix systems.
pub fn decrypt_file(
    engine: &HybridEngine,
    input_path: &Path,
    output_path: &Path,
    prompt: &mut dyn PassphrasePrompt,
) -> Result<()> {
    unlock(engine, prompt)?;
    let plaintext = engine
        .decrypt_file(input_path)
        .map_err(|e| e.with_context(format!("failed to decrypt {}", input_path.display())))?;
    fsutil::write_owner_only(output_path, &plaintext)
        .map_err(|e| e.with_context(format!("failed to write to {}", output_path.display())))?;
    info!(output = %output_path.display(), "file decrypted");
    Ok(())
}

/// Replace the note at `crypt_path` with the contents of `plain_path`.
///
/// The existing note is decrypted first (and the result discarded) so a
/// file sealed for a different key, or one that has been tampered with, is
/// never silently overwritten. The replacement is atomic.
pub fn update_file(
    engine: &HybridEngine,
    plain_path: &Path,
    crypt_path: &Path,
    prompt: &mut dyn PassphrasePrompt,
) -> Result<()> {
    unlock(engine, prompt)?;
    engine
        .decrypt_file(crypt_path)
        .map_err(|e| e.with_context(format!("refusing to replace {}", crypt_path.display())))?;
    engine
        .encrypt_file(plain_path, crypt_path)
        .map_err(|e| e.with_context(format!("failed to update {}", crypt_path.display())))?;
    info!(output = %crypt_path.display(), "file updated");
    Ok(())
}

fn unlock(engine: &HybridEngine, prompt: &mut dyn PassphrasePrompt) -> Result<()> {
    if engine.unlock(prompt)? {
        Ok(())
    } else {
        Err(NotesealError::with_kind(
            ErrorCategory::Authentication,
            ErrorKind::PassphraseUnavailable,
            "no passphrase given; private key stays locked",
        ))
    }
}
