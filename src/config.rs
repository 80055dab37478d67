//! Runtime configuration

use crate::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

/// Per-invocation wall-clock limit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 16;
/// Bytes of age's stderr kept in a failure detail.
pub const DEFAULT_STDERR_LIMIT: usize = 2048;

pub fn default_settings_path() -> PathBuf {
    ProjectDirs::from("", "", "agedrop")
        .map(|p| p.config_dir().join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("agedrop-settings.json"))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit age executable; discovered when `None`.
    pub binary: Option<PathBuf>,
    pub timeout: Duration,
    /// Concurrent age processes per batch. 1 runs files one by one.
    pub workers: usize,
    /// ASCII-armored ciphertext.
    pub armor: bool,
    pub stderr_limit: usize,
    pub settings_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: None,
            timeout: DEFAULT_TIMEOUT,
            workers: DEFAULT_WORKERS,
            armor: true,
            stderr_limit: DEFAULT_STDERR_LIMIT,
            settings_path: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(config_error(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.timeout.is_zero() {
            return Err(config_error("timeout must be greater than zero"));
        }
        if self.stderr_limit == 0 {
            return Err(config_error("stderr limit must be greater than zero"));
        }
        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(default_settings_path)
    }
}

fn config_error(msg: impl Into<String>) -> AgedropError {
    AgedropError::with_kind(ErrorCategory::User, ErrorKind::Config, msg)
}
