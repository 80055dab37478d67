//! Shared fixtures for integration tests
//!
//! A stand-in for age written as a shell script. It understands the flags
//! agedrop passes and changes behavior based on markers in the input name:
//! `__hang__` never finishes, `__slow__` takes a second, `__empty__`
//! produces an empty file, `__noisy__` floods stderr and fails. Encryption needs an `age1` line in the
//! recipients file; decryption needs `GOOD` in the identity.

#![allow(dead_code)]

use agedrop::config::Config;
use agedrop::exec::BinaryProbe;
use agedrop::session::Session;
use agedrop::settings::KeyStore;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;

pub const RECIPIENT: &str = "age1ql3z7hjy54pw3hyww5ayyfg7zqgvc7w3j2elw8zmrj2kg5sfn9aqmcac8p";
pub const GOOD_IDENTITY: &str =
    "AGE-SECRET-KEY-1GOODQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQ";
pub const WRONG_IDENTITY: &str =
    "AGE-SECRET-KEY-1QQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQQ";

/// Header the fake prepends when "encrypting".
pub const FAKE_HEADER: &str = "FAKE-AGE\n";

const FAKE_AGE: &str = r#"#!/bin/sh
mode=""
key=""
out=""
in=""
while [ $# -gt 0 ]; do
  case "$1" in
    --encrypt) mode=enc ;;
    --decrypt) mode=dec ;;
    --armor) ;;
    --recipients-file|--identity) key="$2"; shift ;;
    --output) out="$2"; shift ;;
    *) in="$1" ;;
  esac
  shift
done

case "$in" in
  *__hang__*) exec sleep 30 ;;
  *__slow__*) sleep 1 ;;
  *__noisy__*) head -c 200000 /dev/zero | tr '\0' x >&2; exit 1 ;;
esac

if [ "$mode" = enc ]; then
  grep -q '^age1' "$key" || { echo "age: error: missing recipients" >&2; exit 1; }
  case "$in" in
    *__empty__*) : > "$out"; exit 0 ;;
  esac
  { printf 'FAKE-AGE\n'; cat "$in"; } > "$out"
elif [ "$mode" = dec ]; then
  printf 'partial' > "$out"
  grep -q GOOD "$key" || { echo "age: error: no identity matched any of the recipients" >&2; exit 1; }
  tail -n +2 "$in" > "$out"
else
  echo "age: error: unknown mode" >&2
  exit 2
fi
"#;

/// Path to the fake age script, written once per test process.
///
/// Call this before spawning anything so no child inherits the script's
/// write handle.
pub fn fake_age() -> &'static Path {
    static AGE: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_dir, path) = AGE.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("age");
        fs::write(&path, FAKE_AGE).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    });
    path
}

/// Probe that always answers with a fixed path.
pub struct FixedAge(pub PathBuf);

impl BinaryProbe for FixedAge {
    fn locate(&self) -> Option<PathBuf> {
        Some(self.0.clone())
    }
}

pub fn config(workers: usize, timeout: Duration) -> Config {
    Config {
        workers,
        timeout,
        ..Config::default()
    }
}

/// Session running the fake age with `config` and `store`.
pub fn session(config: &Config, store: impl KeyStore + Send + 'static) -> Session {
    let probe = FixedAge(fake_age().to_path_buf());
    Session::new(config, &probe, Box::new(store)).unwrap()
}

pub fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

pub fn recipient_key(dir: &Path, name: &str) -> PathBuf {
    write(dir, name, &format!("# created: for tests\n{}\n", RECIPIENT))
}

pub fn identity_key(dir: &Path, name: &str, identity: &str) -> PathBuf {
    let contents = format!("# public key: {}\n{}\n", RECIPIENT, identity);
    write(dir, name, &contents)
}

/// Sorted file names in `dir`.
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// True if any staging file is left in `dir`.
pub fn has_partial(dir: &Path) -> bool {
    listing(dir).iter().any(|name| name.ends_with(".partial"))
}
