//! Per-file outcomes and their aggregation into a batch result

use crate::error::{AgedropError, ErrorKind};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Result of processing one dropped item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub status: OutcomeStatus,
    /// Error class of a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl FileOutcome {
    pub fn success(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            status: OutcomeStatus::Success,
            reason: None,
            error_detail: None,
            output: Some(output.into()),
        }
    }

    pub fn failure(input: impl Into<PathBuf>, err: &AgedropError) -> Self {
        Self {
            input: input.into(),
            status: OutcomeStatus::Failure,
            reason: err.kind,
            error_detail: Some(err.detail()),
            output: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }
}

/// Key the session is waiting for before it can run queued payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AwaitedKey {
    Recipient,
    Identity,
}

/// Summary of one drop gesture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionResult {
    /// In drop order.
    pub outcomes: Vec<FileOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
    /// Set when payloads are queued waiting for a key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<AwaitedKey>,
    /// Number of queued payloads.
    pub pending: usize,
}

impl SessionResult {
    pub fn has_failures(&self) -> bool {
        self.failure_count > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Mark the result as waiting for `key` with `pending` payloads queued.
    pub fn awaiting_key(mut self, key: AwaitedKey, pending: usize) -> Self {
        self.awaiting = Some(key);
        self.pending = pending;
        self
    }
}

/// Fold outcomes into a result, keeping their order.
pub fn aggregate(outcomes: Vec<FileOutcome>) -> SessionResult {
    let success_count = outcomes.iter().filter(|o| o.is_success()).count();
    let failure_count = outcomes.len() - success_count;
    SessionResult {
        outcomes,
        success_count,
        failure_count,
        awaiting: None,
        pending: 0,
    }
}
