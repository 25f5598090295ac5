//! Versioned on-disk envelope format
//!
//! An encrypted note is a UTF-8 JSON object:
//!
//! ```text
//! { "version": 2,
//!   "encryptedKey": "<base64>",   RSA-OAEP(SHA-256)-wrapped 256-bit content key
//!   "iv": "<base64>",             96-bit AES-GCM nonce
//!   "authTag": "<base64>",        AES-GCM tag
//!   "content": "<base64>",        ciphertext
//!   "hmac": "<base64>" }          HMAC-SHA256(content key, ciphertext), version >= 2
//! ```
//!
//! Every version up to [`CURRENT_VERSION`] is accepted. Fields this build
//! does not know about are kept in [`EncryptedEnvelope::extra`] and written
//! back out unchanged.

use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Envelope version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// First version that carries an HMAC over the ciphertext.
pub const HMAC_VERSION: u32 = 2;

/// File name suffix of encrypted notes.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

const REQUIRED_FIELDS: [&str; 4] = ["encryptedKey", "iv", "authTag", "content"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub version: u32,
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub hmac: Option<Vec<u8>>,
    /// Optional fields added by newer versions, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EncryptedEnvelope {
    /// Serialize to the on-disk JSON representation.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Operational,
                ErrorKind::InternalInvariant,
                "failed to serialize envelope",
                e,
            )
        })
    }

    /// Parse the on-disk JSON representation.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data).map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Operational,
                ErrorKind::EnvelopeMalformed,
                "input unrecognized as an encrypted envelope",
                e,
            )
        })?;

        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("envelope has no numeric version"))?;
        if version == 0 {
            return Err(malformed("envelope version must be at least 1"));
        }
        if version > u64::from(CURRENT_VERSION) {
            return Err(NotesealError::with_kind(
                ErrorCategory::Operational,
                ErrorKind::EnvelopeFromFuture,
                format!(
                    "envelope version {} is newer than the supported version {}",
                    version, CURRENT_VERSION
                ),
            ));
        }

        serde_json::from_value(value).map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Operational,
                ErrorKind::EnvelopeMalformed,
                format!("invalid envelope: {}", e),
                e,
            )
        })
    }
}

/// Cheap structural check: an object with a numeric version and every
/// required field present as a string. `hmac`, if present, must be a string.
pub fn looks_like_envelope(data: &[u8]) -> bool {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(data) else {
        return false;
    };
    let version_ok = object.get("version").is_some_and(Value::is_u64);
    let fields_ok = REQUIRED_FIELDS
        .iter()
        .all(|field| object.get(*field).is_some_and(Value::is_string));
    let hmac_ok = object
        .get("hmac")
        .is_none_or(|hmac| hmac.is_string() || hmac.is_null());
    version_ok && fields_ok && hmac_ok
}

/// True when the file name ends in [`ENCRYPTED_SUFFIX`].
pub fn has_encrypted_suffix(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.len() > ENCRYPTED_SUFFIX.len() && name.ends_with(ENCRYPTED_SUFFIX)
        })
        .unwrap_or(false)
}

/// Name shown to the user for an encrypted note: the file name without
/// the encrypted suffix (`journal.md.enc` becomes `journal.md`).
pub fn display_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());
    match name.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}

fn malformed(msg: &str) -> NotesealError {
    NotesealError::with_kind(ErrorCategory::Operational, ErrorKind::EnvelopeMalformed, msg)
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("base64 decoding failed: {}", e)))
    }
}

mod base64_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| D::Error::custom(format!("base64 decoding failed: {}", e)))
            })
            .transpose()
    }
}
