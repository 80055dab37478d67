//! Drop handling
//!
//! A [`Session`] is the single owner of the mode state. Each drop gesture
//! is classified item by item, the state machine is updated serially, and
//! only then are payloads handed to a bounded pool of workers. Workers see
//! the builder, the executor and a snapshot of the key material; never the
//! state itself.

use crate::classify::{Role, classify};
use crate::config::Config;
use crate::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use crate::exec::{BinaryProbe, CancelToken, Executor, cancelled};
use crate::invocation::{IdentityKey, InvocationBuilder, KeyMaterial, RecipientKey};
use crate::mode::{Mode, ModeController, SessionState};
use crate::outcome::{AwaitedKey, FileOutcome, SessionResult, aggregate};
use crate::settings::KeyStore;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Position of one item within a batch.
enum Slot {
    Done(FileOutcome),
    Run(PathBuf),
}

#[derive(Debug)]
pub struct Session {
    controller: ModeController,
    builder: InvocationBuilder,
    executor: Executor,
    workers: usize,
    /// Payloads admitted while their key was missing, in drop order.
    queue: Vec<PathBuf>,
    cancel: CancelToken,
}

impl Session {
    /// Validate `config`, locate age once, and restore the remembered key.
    ///
    /// Fails with [`ErrorKind::BinaryNotFound`] before any drop is accepted
    /// when `probe` cannot find age.
    pub fn new(
        config: &Config,
        probe: &dyn BinaryProbe,
        store: Box<dyn KeyStore + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let binary = probe.locate().ok_or_else(|| {
            AgedropError::with_kind(
                ErrorCategory::User,
                ErrorKind::BinaryNotFound,
                "age executable not found; install age or point --age at it",
            )
        })?;
        info!(binary = %binary.display(), "using age");

        Ok(Self {
            controller: ModeController::new(store),
            builder: InvocationBuilder::new(config.armor),
            executor: Executor::new(binary, config.timeout).with_stderr_limit(config.stderr_limit),
            workers: config.workers,
            queue: Vec::new(),
            cancel: CancelToken::new(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.controller.mode()
    }

    pub fn state(&self) -> &SessionState {
        self.controller.state()
    }

    /// Payloads waiting for a key.
    pub fn pending(&self) -> &[PathBuf] {
        &self.queue
    }

    /// Handle for cancelling the batch that is currently running.
    ///
    /// A cancel only affects the batch running at that moment; it is
    /// cleared when the next batch starts and on [`Session::reset`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drop queued payloads and the held identity, back to idle.
    pub fn reset(&mut self) {
        if !self.queue.is_empty() {
            info!(dropped = self.queue.len(), "discarding queued payloads");
        }
        self.queue.clear();
        self.controller.reset();
        self.cancel.reset();
    }

    /// Forget the remembered recipient key as well.
    pub fn forget_recipient(&mut self) -> Result<()> {
        self.reset();
        self.controller.forget_recipient()
    }

    /// Process one drop gesture.
    ///
    /// Payloads queued by earlier drops come first, followed by this drop's
    /// items in order. A payload already queued is not queued again. Keys
    /// produce an outcome only when rejected.
    pub fn submit_drop<P: AsRef<Path>>(&mut self, paths: &[P]) -> SessionResult {
        let mut slots: Vec<Slot> = self.queue.drain(..).map(Slot::Run).collect();
        for entry in expand_drop(paths) {
            match entry {
                Ok(path) => match self.admit(path) {
                    Some(Slot::Run(path)) if is_queued(&slots, &path) => {
                        debug!(path = %path.display(), "payload already queued");
                    }
                    Some(slot) => slots.push(slot),
                    None => {}
                },
                Err(outcome) => slots.push(Slot::Done(outcome)),
            }
        }

        let queued = slots.iter().filter(|s| matches!(s, Slot::Run(_))).count();
        if queued == 0 {
            return aggregate(done_only(slots));
        }

        let mode = self.controller.mode();
        let Some(key) = self.controller.key_material() else {
            let mut outcomes = Vec::new();
            for slot in slots {
                match slot {
                    Slot::Run(path) => self.queue.push(path),
                    Slot::Done(outcome) => outcomes.push(outcome),
                }
            }
            let awaited = match mode {
                Mode::Decrypt => AwaitedKey::Identity,
                _ => AwaitedKey::Recipient,
            };
            info!(pending = self.queue.len(), ?awaited, "waiting for key");
            return aggregate(outcomes).awaiting_key(awaited, self.queue.len());
        };

        self.cancel.reset();
        let outcomes = self.run_batch(mode, &key, slots);
        self.controller.complete_batch();
        self.cancel.reset();
        aggregate(outcomes)
    }

    /// Classify one item and apply it to the state machine.
    fn admit(&mut self, path: PathBuf) -> Option<Slot> {
        let rejected = match classify(&path).role {
            Role::Unknown(reason) => Err(AgedropError::with_kind(
                ErrorCategory::User,
                ErrorKind::Classification,
                format!("cannot process {}: {}", path.display(), reason),
            )),
            Role::Payload(kind) => match self.controller.admit_payload(&path, kind) {
                Ok(_) => return Some(Slot::Run(path)),
                Err(e) => Err(e),
            },
            Role::PublicKey => self.controller.accept_recipient(RecipientKey::new(&path)),
            Role::PrivateKey => self.controller.accept_identity(IdentityKey::new(&path)),
        };
        rejected.err().map(|e| {
            debug!(path = %path.display(), error = %e.detail(), "item rejected");
            Slot::Done(FileOutcome::failure(path, &e))
        })
    }

    /// Run every `Slot::Run` on the worker pool; outcomes keep slot order.
    fn run_batch(&self, mode: Mode, key: &KeyMaterial, slots: Vec<Slot>) -> Vec<FileOutcome> {
        let mut results: Vec<Option<FileOutcome>> = Vec::with_capacity(slots.len());
        let mut jobs: Vec<(usize, PathBuf)> = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Slot::Done(outcome) => results.push(Some(outcome)),
                Slot::Run(path) => {
                    jobs.push((index, path));
                    results.push(None);
                }
            }
        }

        let workers = self.workers.clamp(1, jobs.len().max(1));
        info!(files = jobs.len(), workers, %mode, "running batch");

        let builder = &self.builder;
        let executor = &self.executor;
        let cancel = &self.cancel;
        let jobs = &jobs;
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || {
                    while let Some((index, path)) = jobs.get(next.fetch_add(1, Ordering::SeqCst)) {
                        let outcome = process_one(builder, executor, cancel, mode, path, key);
                        if tx.send((*index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        for (index, outcome) in rx {
            results[index] = Some(outcome);
        }
        results.into_iter().flatten().collect()
    }
}

fn process_one(
    builder: &InvocationBuilder,
    executor: &Executor,
    cancel: &CancelToken,
    mode: Mode,
    path: &Path,
    key: &KeyMaterial,
) -> FileOutcome {
    if cancel.is_cancelled() {
        return FileOutcome::failure(path, &cancelled());
    }
    match builder.build(mode, path, Some(key)) {
        Ok(spec) => executor.run(spec, cancel),
        Err(e) => {
            warn!(input = %path.display(), error = %e.detail(), "cannot prepare age");
            FileOutcome::failure(path, &e)
        }
    }
}

fn is_queued(slots: &[Slot], path: &Path) -> bool {
    slots
        .iter()
        .any(|slot| matches!(slot, Slot::Run(queued) if queued == path))
}

fn done_only(slots: Vec<Slot>) -> Vec<FileOutcome> {
    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Done(outcome) => Some(outcome),
            Slot::Run(_) => None,
        })
        .collect()
}

/// Replace dropped folders by the regular files below them, sorted by name.
/// Hidden items are skipped, whether dropped directly or found in a folder.
fn expand_drop<P: AsRef<Path>>(paths: &[P]) -> Vec<std::result::Result<PathBuf, FileOutcome>> {
    let mut entries = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.file_name().is_some_and(is_hidden) {
            info!(path = %path.display(), "skipping hidden item");
            continue;
        }
        if !path.is_dir() {
            entries.push(Ok(path.to_path_buf()));
            continue;
        }

        let before = entries.len();
        let walker = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            match entry {
                Ok(entry) if entry.path().is_file() => entries.push(Ok(entry.into_path())),
                Ok(_) => {}
                Err(e) => {
                    let at = e.path().unwrap_or(path).to_path_buf();
                    let err = AgedropError::with_kind_and_source(
                        ErrorCategory::User,
                        ErrorKind::Classification,
                        format!("cannot read {}", at.display()),
                        e,
                    );
                    entries.push(Err(FileOutcome::failure(at, &err)));
                }
            }
        }

        if entries.len() == before {
            let msg = format!("cannot process {}: no files in folder", path.display());
            let err = AgedropError::with_kind(ErrorCategory::User, ErrorKind::Classification, msg);
            entries.push(Err(FileOutcome::failure(path, &err)));
        }
    }
    entries
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemoryKeyStore;
    use std::fs;
    use tempfile::TempDir;

    struct NoAge;

    impl BinaryProbe for NoAge {
        fn locate(&self) -> Option<PathBuf> {
            None
        }
    }

    struct FixedAge(PathBuf);

    impl BinaryProbe for FixedAge {
        fn locate(&self) -> Option<PathBuf> {
            Some(self.0.clone())
        }
    }

    fn expanded(paths: &[PathBuf]) -> Vec<PathBuf> {
        expand_drop(paths)
            .into_iter()
            .map(|e| match e {
                Ok(path) => path,
                Err(outcome) => outcome.input,
            })
            .collect()
    }

    #[test]
    fn test_missing_binary_is_fatal() {
        let err = Session::new(&Config::default(), &NoAge, Box::new(MemoryKeyStore::new()))
            .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::BinaryNotFound));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        let err = Session::new(
            &config,
            &FixedAge(PathBuf::from("age")),
            Box::new(MemoryKeyStore::new()),
        )
        .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::Config));
    }

    fn idle_session() -> Session {
        Session::new(
            &Config::default(),
            &FixedAge(PathBuf::from("age")),
            Box::new(MemoryKeyStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_expand_folder_sorted_without_hidden() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("docs");
        fs::create_dir_all(folder.join("sub")).unwrap();
        fs::create_dir_all(folder.join(".git")).unwrap();
        fs::write(folder.join("b.txt"), b"b").unwrap();
        fs::write(folder.join("a.txt"), b"a").unwrap();
        fs::write(folder.join(".DS_Store"), b"x").unwrap();
        fs::write(folder.join(".git").join("config"), b"x").unwrap();
        fs::write(folder.join("sub").join("c.txt"), b"c").unwrap();
        let loose = dir.path().join("loose.txt");
        fs::write(&loose, b"l").unwrap();
        let hidden = dir.path().join(".env");
        fs::write(&hidden, b"h").unwrap();
        let hidden_dir = dir.path().join(".cache");
        fs::create_dir(&hidden_dir).unwrap();
        fs::write(hidden_dir.join("d.txt"), b"d").unwrap();

        let dropped = [hidden, loose.clone(), hidden_dir, folder.clone()];
        assert_eq!(
            expanded(&dropped),
            vec![
                loose,
                folder.join("a.txt"),
                folder.join("b.txt"),
                folder.join("sub").join("c.txt"),
            ]
        );
    }

    #[test]
    fn test_empty_folder_is_reported() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("empty");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join(".hidden"), b"x").unwrap();

        let entries = expand_drop(&[folder.clone()]);
        assert_eq!(entries.len(), 1);
        let outcome = entries.into_iter().next().unwrap().unwrap_err();
        assert_eq!(outcome.input, folder);
        assert_eq!(outcome.reason, Some(ErrorKind::Classification));
    }

    #[test]
    fn test_unknown_items_and_keys_without_payloads() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("r1.pub");
        fs::write(
            &key,
            "age1ql3z7hjy54pw3hyww5ayyfg7zqgvc7w3j2elw8zmrj2kg5sfn9aqmcac8p\n",
        )
        .unwrap();
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();

        let store = MemoryKeyStore::new();
        let mut session = Session::new(
            &Config::default(),
            &FixedAge(PathBuf::from("age")),
            Box::new(store.clone()),
        )
        .unwrap();

        let result = session.submit_drop(&[empty.clone(), key.clone()]);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.outcomes[0].input, empty);
        assert_eq!(result.outcomes[0].reason, Some(ErrorKind::Classification));
        assert_eq!(result.awaiting, None);
        assert_eq!(session.mode(), Mode::Idle);
        assert_eq!(store.recipient(), Some(key));
    }

    #[test]
    fn test_payload_without_key_is_queued() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, b"hello").unwrap();

        let mut session = idle_session();
        let result = session.submit_drop(&[&a]);
        assert!(result.outcomes.is_empty());
        assert_eq!(result.awaiting, Some(AwaitedKey::Recipient));
        assert_eq!(result.pending, 1);
        assert_eq!(session.mode(), Mode::Encrypt);
        assert_eq!(session.pending(), &[a]);

        session.reset();
        assert_eq!(session.mode(), Mode::Idle);
        assert!(session.pending().is_empty());
    }

    #[test]
    fn test_payload_dropped_twice_is_queued_once() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut session = idle_session();
        session.submit_drop(&[&a]);
        let result = session.submit_drop(&[&b, &a, &b]);
        assert_eq!(result.pending, 2);
        assert_eq!(session.pending(), &[a, b]);
    }

    #[test]
    fn test_reset_clears_cancel() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, b"a").unwrap();

        let mut session = idle_session();
        session.submit_drop(&[&a]);
        let token = session.cancel_token();
        token.cancel();
        session.reset();
        assert!(!token.is_cancelled());
    }
}
