//! Operating mode state machine
//!
//! `Idle` until the first payload of a logical session is admitted, then
//! fixed to `Encrypt` or `Decrypt` until the batch completes or the session
//! is reset. Payloads and keys that conflict with the fixed mode are
//! rejected without touching any state.

use crate::classify::{PayloadKind, Role, classify};
use crate::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use crate::invocation::{IdentityKey, KeyMaterial, RecipientKey};
use crate::settings::KeyStore;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Idle,
    Encrypt,
    Decrypt,
}

impl From<PayloadKind> for Mode {
    fn from(kind: PayloadKind) -> Self {
        match kind {
            PayloadKind::Encrypt => Mode::Encrypt,
            PayloadKind::Decrypt => Mode::Decrypt,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Idle => "idle",
            Mode::Encrypt => "encryption",
            Mode::Decrypt => "decryption",
        })
    }
}

/// Everything the controller owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub mode: Mode,
    /// Persisted across sessions through the key store.
    pub remembered_recipient: Option<RecipientKey>,
    /// Held for the current logical session only; never persisted.
    pub identity: Option<IdentityKey>,
}

pub struct ModeController {
    state: SessionState,
    store: Box<dyn KeyStore + Send>,
}

impl fmt::Debug for ModeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeController")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ModeController {
    /// Start idle, restoring the remembered recipient from `store`.
    ///
    /// A remembered key that no longer exists or no longer looks like a
    /// recipient key is forgotten, both here and in the store.
    pub fn new(store: Box<dyn KeyStore + Send>) -> Self {
        let remembered = match store.load_recipient() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e.detail(), "could not load remembered recipient key");
                None
            }
        };

        let remembered_recipient = match remembered {
            Some(path) if classify(&path).role == Role::PublicKey => {
                info!(key = %path.display(), "restored remembered recipient key");
                Some(RecipientKey::new(path))
            }
            Some(path) => {
                warn!(key = %path.display(), "remembered recipient key no longer usable");
                if let Err(e) = store.save_recipient(None) {
                    warn!(error = %e.detail(), "could not clear remembered recipient key");
                }
                None
            }
            None => None,
        };

        Self {
            state: SessionState {
                remembered_recipient,
                ..SessionState::default()
            },
            store,
        }
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn remembered_recipient(&self) -> Option<&RecipientKey> {
        self.state.remembered_recipient.as_ref()
    }

    pub fn identity(&self) -> Option<&IdentityKey> {
        self.state.identity.as_ref()
    }

    /// Admit a payload, fixing the mode if still idle.
    pub fn admit_payload(&mut self, path: &Path, kind: PayloadKind) -> Result<Mode> {
        let wanted = Mode::from(kind);
        match self.state.mode {
            Mode::Idle => {
                info!(mode = %wanted, "operating mode selected");
                self.state.mode = wanted;
                Ok(wanted)
            }
            current if current == wanted => Ok(current),
            current => Err(mismatch(path, wanted, current)),
        }
    }

    /// Remember a recipient key. Last one wins.
    ///
    /// Rejected while decrypting. The key is persisted before it replaces
    /// the current one, so a storage failure leaves the state unchanged.
    pub fn accept_recipient(&mut self, key: RecipientKey) -> Result<()> {
        if self.state.mode == Mode::Decrypt {
            return Err(mismatch(key.path(), Mode::Encrypt, Mode::Decrypt));
        }
        if let Some(previous) = &self.state.remembered_recipient {
            if previous != &key {
                debug!(previous = %previous.path().display(), "replacing recipient key");
            }
        }
        if let Err(e) = self.store.save_recipient(Some(key.path())) {
            let context = format!("could not remember {}", key.path().display());
            return Err(e.with_context(context));
        }
        info!(key = %key.path().display(), "recipient key remembered");
        self.state.remembered_recipient = Some(key);
        Ok(())
    }

    /// Hold an identity for this logical session. Rejected while encrypting.
    pub fn accept_identity(&mut self, key: IdentityKey) -> Result<()> {
        if self.state.mode == Mode::Encrypt {
            return Err(mismatch(key.path(), Mode::Decrypt, Mode::Encrypt));
        }
        info!(key = %key.path().display(), "identity key held for this session");
        self.state.identity = Some(key);
        Ok(())
    }

    /// Key material for the current mode, if available.
    pub fn key_material(&self) -> Option<KeyMaterial> {
        match self.state.mode {
            Mode::Encrypt => self
                .state
                .remembered_recipient
                .clone()
                .map(KeyMaterial::Recipient),
            Mode::Decrypt => self.state.identity.clone().map(KeyMaterial::Identity),
            Mode::Idle => None,
        }
    }

    /// All queued payloads were processed: back to idle, identity dropped.
    pub fn complete_batch(&mut self) {
        debug!(mode = %self.state.mode, "batch complete");
        self.reset();
    }

    /// Start over without forgetting the remembered recipient.
    pub fn reset(&mut self) {
        self.state.mode = Mode::Idle;
        self.state.identity = None;
    }

    /// Forget the remembered recipient, in memory and in the store.
    pub fn forget_recipient(&mut self) -> Result<()> {
        self.store.save_recipient(None)?;
        self.state.remembered_recipient = None;
        info!("remembered recipient key forgotten");
        Ok(())
    }
}

fn mismatch(path: &Path, wanted: Mode, current: Mode) -> AgedropError {
    AgedropError::with_kind(
        ErrorCategory::User,
        ErrorKind::ModeMismatch,
        format!(
            "mode mismatch: {} belongs to {} but this session is doing {}",
            path.display(),
            wanted,
            current
        ),
    )
}
