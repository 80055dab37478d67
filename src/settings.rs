//! Persistence of the remembered recipient key
//!
//! Only the recipient key location is ever stored. Identities are never
//! written anywhere by agedrop.

use crate::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Storage for the remembered recipient key reference.
pub trait KeyStore {
    /// The remembered recipient key file, if any.
    fn load_recipient(&self) -> Result<Option<PathBuf>>;

    /// Remember `key`, or forget the current one when `None`.
    fn save_recipient(&self, key: Option<&Path>) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredSettings {
    #[serde(default)]
    remember_keys: bool,
    #[serde(default)]
    recipient_key: Option<PathBuf>,
}

/// JSON file store. A missing file means nothing is remembered.
#[derive(Debug, Clone)]
pub struct JsonKeyStore {
    path: PathBuf,
}

impl JsonKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoredSettings> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredSettings::default()),
            Err(e) => return Err(self.error("failed to read", e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| self.error("failed to parse", e))
    }

    /// Atomic rewrite: tempfile in the same directory, fsync, rename.
    fn write(&self, settings: &StoredSettings) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| self.error("failed to create directory for", e))?;

        let json = serde_json::to_vec_pretty(settings)
            .map_err(|e| self.error("failed to serialize", e))?;
        let mut temp_file =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| self.error("failed to stage", e))?;
        temp_file
            .write_all(&json)
            .and_then(|()| temp_file.flush())
            .map_err(|e| self.error("failed to write", e))?;
        // Flush and fsync() such that the rename, if it succeeds, always
        // points to a complete file.
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| self.error("failed to sync", e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| self.error("failed to replace", e.error))?;
        Ok(())
    }

    fn error(
        &self,
        what: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> AgedropError {
        AgedropError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Settings,
            format!("{} settings file {}", what, self.path.display()),
            source,
        )
    }
}

impl KeyStore for JsonKeyStore {
    fn load_recipient(&self) -> Result<Option<PathBuf>> {
        let settings = self.read()?;
        Ok(settings.recipient_key.filter(|_| settings.remember_keys))
    }

    fn save_recipient(&self, key: Option<&Path>) -> Result<()> {
        self.write(&StoredSettings {
            remember_keys: key.is_some(),
            recipient_key: key.map(Path::to_path_buf),
        })
    }
}

/// In-process store; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    slot: Arc<Mutex<Option<PathBuf>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recipient(path: impl Into<PathBuf>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(path.into()))),
        }
    }

    /// Current contents, for inspection.
    pub fn recipient(&self) -> Option<PathBuf> {
        self.slot.lock().map(|slot| slot.clone()).unwrap_or(None)
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_recipient(&self) -> Result<Option<PathBuf>> {
        Ok(self.recipient())
    }

    fn save_recipient(&self, key: Option<&Path>) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| {
            AgedropError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::Settings,
                "in-memory key store poisoned",
            )
        })?;
        *slot = key.map(Path::to_path_buf);
        Ok(())
    }
}
