//! Running the age binary
//!
//! One [`InvocationSpec`] in, one [`FileOutcome`] out. age writes into a
//! hidden staging file which is moved to its final name only after a clean
//! exit; every other path removes it.

use crate::config::DEFAULT_STDERR_LIMIT;
use crate::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use crate::invocation::InvocationSpec;
use crate::outcome::FileOutcome;
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on `name (N).ext` attempts when the output name is taken.
const MAX_NAME_ATTEMPTS: usize = 10_000;

#[cfg(windows)]
const BINARY_NAME: &str = "age.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "age";

/// Shared flag used by the presentation layer to cancel a running batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Finds the age executable.
pub trait BinaryProbe {
    fn locate(&self) -> Option<PathBuf>;

    fn is_binary_available(&self) -> bool {
        self.locate().is_some()
    }
}

/// Explicit path if configured, else `age` next to the running executable,
/// else `age` on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    explicit: Option<PathBuf>,
}

impl SystemProbe {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }
}

impl BinaryProbe for SystemProbe {
    fn locate(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.explicit {
            return which::which(explicit).ok();
        }
        let bundled = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(BINARY_NAME)))
            .filter(|candidate| candidate.is_file());
        bundled.or_else(|| which::which(BINARY_NAME).ok())
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    binary: PathBuf,
    timeout: Duration,
    stderr_limit: usize,
}

impl Executor {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }

    /// Bound, in bytes, for diagnostic text kept from age's stderr.
    pub fn with_stderr_limit(mut self, limit: usize) -> Self {
        self.stderr_limit = limit;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run one invocation to completion and report what happened.
    pub fn run(&self, spec: InvocationSpec, cancel: &CancelToken) -> FileOutcome {
        let input = spec.input_path().to_path_buf();
        let started = Instant::now();
        let result = self.execute(&spec, cancel);
        drop(spec);

        match result {
            Ok(output) => {
                info!(
                    input = %input.display(),
                    output = %output.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "age finished"
                );
                FileOutcome::success(input, output)
            }
            Err(e) => {
                warn!(input = %input.display(), error = %e.detail(), "age failed");
                FileOutcome::failure(input, &e)
            }
        }
    }

    fn execute(&self, spec: &InvocationSpec, cancel: &CancelToken) -> Result<PathBuf> {
        // Removed on drop unless moved into place.
        let staged = TempPath::from_path(spec.staging_path());

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        debug!(binary = %self.binary.display(), args = ?spec.args(), "starting age");
        let mut child = Command::new(&self.binary)
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Drained on its own thread so a chatty child never blocks on a full
        // pipe. Left detached if the child has to be killed.
        let limit = self.stderr_limit;
        let pipe = child.stderr.take();
        let stderr_reader = pipe.map(|p| thread::spawn(move || read_bounded(p, limit)));

        let status = self.wait(&mut child, cancel)?;
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(self.process_failure(status, &stderr));
        }

        match fs::metadata(spec.staging_path()) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => {
                return Err(AgedropError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::Process,
                    "age reported success but produced an empty output file",
                ));
            }
            Err(e) => {
                return Err(AgedropError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Process,
                    "age reported success but produced no output file",
                    e,
                ));
            }
        }

        persist_unique(staged, spec.output_path())
    }

    fn wait(&self, child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(timeout = ?self.timeout, "age timed out, killing it");
                terminate(child);
                return Err(AgedropError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::Timeout,
                    format!("timeout: age did not finish within {:?}", self.timeout),
                ));
            }

            let waited = child.wait_timeout(remaining.min(POLL_INTERVAL));
            match waited {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if cancel.is_cancelled() => {
                    info!("batch cancelled, killing age");
                    terminate(child);
                    return Err(cancelled());
                }
                Ok(None) => {}
                Err(e) => {
                    terminate(child);
                    return Err(AgedropError::with_kind_and_source(
                        ErrorCategory::Internal,
                        ErrorKind::Process,
                        "failed to wait for age",
                        e,
                    ));
                }
            }
        }
    }

    fn spawn_error(&self, err: io::Error) -> AgedropError {
        let msg = match err.kind() {
            io::ErrorKind::NotFound => {
                format!("could not start age: {} not found", self.binary.display())
            }
            io::ErrorKind::PermissionDenied => format!(
                "could not start age: permission denied for {}",
                self.binary.display()
            ),
            _ => format!("could not start age at {}", self.binary.display()),
        };
        AgedropError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Process, msg, err)
    }

    fn process_failure(&self, status: ExitStatus, stderr: &[u8]) -> AgedropError {
        let text = String::from_utf8_lossy(stderr);
        let text = text.trim();
        let detail = match (friendly_hint(text), text.is_empty()) {
            (_, true) => format!("age failed with {}", status),
            (Some(hint), false) => format!("{} ({})", hint, truncate(text, self.stderr_limit)),
            (None, false) => truncate(text, self.stderr_limit),
        };
        AgedropError::with_kind(ErrorCategory::User, ErrorKind::Process, detail)
    }
}

/// First `limit + 1` bytes of `pipe`; the rest is read and discarded.
fn read_bounded(mut pipe: impl Read, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.by_ref().take(limit as u64 + 1).read_to_end(&mut buf);
    let _ = io::copy(&mut pipe, &mut io::sink());
    buf
}

pub(crate) fn cancelled() -> AgedropError {
    AgedropError::with_kind(ErrorCategory::User, ErrorKind::Cancelled, "cancelled")
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill failed, child probably exited already");
    }
    let _ = child.wait();
}

/// Move the staged file to `target`, or to the first free `name (N).ext`.
fn persist_unique(mut staged: TempPath, target: &Path) -> Result<PathBuf> {
    for candidate in output_candidates(target).take(MAX_NAME_ATTEMPTS) {
        match staged.persist_noclobber(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(taken = %candidate.display(), "output name taken");
                staged = e.path;
            }
            Err(e) => {
                let msg = format!("failed to move output to {}", candidate.display());
                return Err(AgedropError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    msg,
                    e.error,
                ));
            }
        }
    }
    Err(AgedropError::with_kind(
        ErrorCategory::User,
        ErrorKind::Io,
        format!("no free output name next to {}", target.display()),
    ))
}

/// `target` itself, then `stem (N).ext` with N counting up. An existing
/// ` (N)` suffix on the stem is continued rather than nested.
pub(crate) fn output_candidates(target: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target.extension().map(OsStr::to_string_lossy);
    let (base, first) = split_counter(&stem);
    let base = base.to_string();

    let numbered = (first..).map(move |n| {
        let mut name = format!("{} ({})", base, n);
        if let Some(ext) = &ext {
            name.push('.');
            name.push_str(ext);
        }
        target.with_file_name(name)
    });
    std::iter::once(target.to_path_buf()).chain(numbered)
}

fn split_counter(stem: &str) -> (&str, u64) {
    let counted = stem.strip_suffix(')').and_then(|s| s.rsplit_once(" ("));
    if let Some((base, digits)) = counted {
        let numeric = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
        if let (true, Ok(n)) = (numeric, digits.parse::<u64>()) {
            return (base, n.saturating_add(1));
        }
    }
    (stem, 1)
}

/// Clearer wording for well-known age diagnostics.
fn friendly_hint(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();
    if lower.contains("missing recipients") {
        Some("encryption failed: missing recipient public key")
    } else if lower.contains("no identity matched") || lower.contains("no matching keys") {
        Some("decryption failed: the identity key does not match this file")
    } else if lower.contains("passphrase-encrypted") {
        Some("decryption failed: the file was encrypted with a passphrase, not to a key")
    } else if lower.contains("encrypted identity") {
        Some("decryption failed: the identity key is passphrase-protected, use an unencrypted key")
    } else if lower.contains("no secrets provided") || lower.contains("no identities specified") {
        Some("decryption failed: no identity key provided")
    } else {
        None
    }
}

/// At most `limit` bytes of `text`, cut on a character boundary.
pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
