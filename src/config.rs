//! Settings file
//!
//! `$XDG_CONFIG_HOME/noteseal/config.toml` (or `~/.config/noteseal/...`).
//! Every section and key is optional; a missing file means defaults.

use crate::engine::{DEFAULT_SESSION_TIMEOUT, KeyConfig};
use crate::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use crate::lifecycle::{DEFAULT_DEBOUNCE, DEFAULT_WATCH_INTERVAL, LifecycleConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub keys: KeysSection,
    pub session: SessionSection,
    pub editing: EditingSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeysSection {
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    /// Minutes of inactivity before auto-lock; 0 disables it.
    pub timeout_minutes: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_minutes: DEFAULT_SESSION_TIMEOUT.as_secs() / 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditingSection {
    pub debounce_ms: u64,
    /// 0 disables the change watch.
    pub watch_interval_ms: u64,
}

impl Default for EditingSection {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            watch_interval_ms: DEFAULT_WATCH_INTERVAL.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(NotesealError::io("read", path, e)),
        };
        Self::parse(&contents)
            .map_err(|e| e.with_context(format!("invalid settings in {}", path.display())))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Configuration,
                ErrorKind::InvalidSettings,
                format!("failed to parse settings: {}", e),
                e,
            )
        })
    }

    pub fn key_config(&self) -> KeyConfig {
        KeyConfig {
            public_key_path: self.keys.public_key.clone(),
            private_key_path: self.keys.private_key.clone(),
            session_timeout: Some(Duration::from_secs(
                self.session.timeout_minutes.saturating_mul(60),
            )),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            debounce: Duration::from_millis(self.editing.debounce_ms),
            watch_interval: Some(Duration::from_millis(self.editing.watch_interval_ms))
                .filter(|interval| !interval.is_zero()),
        }
    }
}

/// Default location of the settings file.
pub fn default_settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// `$XDG_CONFIG_HOME/noteseal`, falling back to `~/.config/noteseal`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(value) = std::env::var_os("XDG_CONFIG_HOME") {
        if !value.is_empty() {
            return Some(PathBuf::from(value).join("noteseal"));
        }
    }
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".config").join("noteseal"))
}
