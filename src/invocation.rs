//! Construction of age command lines
//!
//! Key material never appears on the command line. Recipients are copied
//! (comments stripped) and identities are copied verbatim into a private
//! temporary file that lives exactly as long as the [`InvocationSpec`].

use crate::classify::{AGE_EXTENSION, first_meaningful_line};
use crate::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use crate::mode::Mode;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempPath;
use zeroize::Zeroizing;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// A file holding one or more recipient public keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientKey(PathBuf);

impl RecipientKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// A file holding an identity (private key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey(PathBuf);

impl IdentityKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Key material handed to the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Recipient(RecipientKey),
    Identity(IdentityKey),
}

/// A fully prepared age invocation for one payload.
///
/// Dropping the invocation removes the temporary key file.
#[derive(Debug)]
pub struct InvocationSpec {
    args: Vec<OsString>,
    input: PathBuf,
    output: PathBuf,
    staging: PathBuf,
    _key_file: TempPath,
}

impl InvocationSpec {
    /// Arguments passed to the age binary, excluding the program itself.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    /// Where the result should end up.
    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Where age is told to write; renamed to the output path on success.
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }
}

#[derive(Debug, Clone)]
pub struct InvocationBuilder {
    armor: bool,
}

impl Default for InvocationBuilder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InvocationBuilder {
    /// `armor` selects ASCII-armored ciphertext when encrypting.
    pub fn new(armor: bool) -> Self {
        Self { armor }
    }

    /// Build the invocation that runs `mode` on `payload` with `key`.
    ///
    /// Fails with [`ErrorKind::MissingKey`] when no key of the kind the mode
    /// needs is supplied, and with [`ErrorKind::AmbiguousOutput`] when no
    /// output name can be derived from `payload`.
    pub fn build(
        &self,
        mode: Mode,
        payload: &Path,
        key: Option<&KeyMaterial>,
    ) -> Result<InvocationSpec> {
        match (mode, key) {
            (Mode::Encrypt, Some(KeyMaterial::Recipient(recipient))) => {
                self.build_encrypt(payload, recipient)
            }
            (Mode::Decrypt, Some(KeyMaterial::Identity(identity))) => {
                self.build_decrypt(payload, identity)
            }
            (Mode::Encrypt, _) => Err(AgedropError::with_kind(
                ErrorCategory::User,
                ErrorKind::MissingKey,
                "encryption needs a recipient public key",
            )),
            (Mode::Decrypt, _) => Err(AgedropError::with_kind(
                ErrorCategory::User,
                ErrorKind::MissingKey,
                "decryption needs an identity private key",
            )),
            (Mode::Idle, _) => Err(AgedropError::new(
                ErrorCategory::Internal,
                "no operating mode selected",
            )),
        }
    }

    fn build_encrypt(&self, payload: &Path, recipient: &RecipientKey) -> Result<InvocationSpec> {
        let output = encrypted_output_path(payload)?;
        let staging = staging_path(&output)?;
        let key_file = recipients_file(recipient)?;

        let mut args: Vec<OsString> = vec!["--encrypt".into()];
        if self.armor {
            args.push("--armor".into());
        }
        args.push("--recipients-file".into());
        args.push(key_file.as_os_str().to_owned());
        args.push("--output".into());
        args.push(staging.as_os_str().to_owned());
        args.push(dash_safe(payload).into_os_string());

        Ok(InvocationSpec {
            args,
            input: payload.to_path_buf(),
            output,
            staging,
            _key_file: key_file,
        })
    }

    fn build_decrypt(&self, payload: &Path, identity: &IdentityKey) -> Result<InvocationSpec> {
        let output = decrypted_output_path(payload)?;
        let staging = staging_path(&output)?;
        let key_file = identity_file(identity)?;

        let args: Vec<OsString> = vec![
            "--decrypt".into(),
            "--identity".into(),
            key_file.as_os_str().to_owned(),
            "--output".into(),
            staging.as_os_str().to_owned(),
            dash_safe(payload).into_os_string(),
        ];

        Ok(InvocationSpec {
            args,
            input: payload.to_path_buf(),
            output,
            staging,
            _key_file: key_file,
        })
    }
}

/// `payload` with `.age` appended.
pub fn encrypted_output_path(payload: &Path) -> Result<PathBuf> {
    let name = payload.file_name().ok_or_else(|| ambiguous(payload))?;
    let mut out_name = name.to_os_string();
    out_name.push(".");
    out_name.push(AGE_EXTENSION);
    Ok(payload.with_file_name(out_name))
}

/// `payload` with its `.age` extension removed.
pub fn decrypted_output_path(payload: &Path) -> Result<PathBuf> {
    let is_age = payload
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(AGE_EXTENSION));
    match payload.file_stem() {
        Some(stem) if is_age && !stem.is_empty() => Ok(payload.with_file_name(stem)),
        _ => Err(ambiguous(payload)),
    }
}

fn ambiguous(payload: &Path) -> AgedropError {
    AgedropError::with_kind(
        ErrorCategory::User,
        ErrorKind::AmbiguousOutput,
        format!("cannot derive an output name for {}", payload.display()),
    )
}

/// Hidden, unique sibling of `output` for age to write into.
fn staging_path(output: &Path) -> Result<PathBuf> {
    let name = output.file_name().ok_or_else(|| ambiguous(output))?;
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut staged = OsString::from(".");
    staged.push(name);
    staged.push(format!(".agedrop-{}-{}.partial", process::id(), seq));
    Ok(output.with_file_name(staged))
}

/// Relative paths starting with `-` would be read as flags.
fn dash_safe(path: &Path) -> PathBuf {
    if path.as_os_str().to_string_lossy().starts_with('-') {
        Path::new(".").join(path)
    } else {
        path.to_path_buf()
    }
}

fn recipients_file(recipient: &RecipientKey) -> Result<TempPath> {
    let contents =
        fs::read_to_string(recipient.path()).map_err(|e| key_read_error(recipient.path(), e))?;
    let lines: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    if lines.is_empty() {
        return Err(AgedropError::with_kind(
            ErrorCategory::User,
            ErrorKind::MissingKey,
            format!("no usable recipients in {}", recipient.path().display()),
        ));
    }
    let mut sanitized = lines.join("\n");
    sanitized.push('\n');
    write_private_temp("recipients", sanitized.as_bytes())
}

fn identity_file(identity: &IdentityKey) -> Result<TempPath> {
    let contents = Zeroizing::new(
        fs::read(identity.path()).map_err(|e| key_read_error(identity.path(), e))?,
    );
    let usable = first_meaningful_line(&String::from_utf8_lossy(&contents)).is_some();
    if !usable {
        return Err(AgedropError::with_kind(
            ErrorCategory::User,
            ErrorKind::MissingKey,
            format!("no usable identity in {}", identity.path().display()),
        ));
    }
    write_private_temp("identity", &contents)
}

/// Temporary file readable by the owner only; removed when the path drops.
fn write_private_temp(label: &str, contents: &[u8]) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!(".agedrop-{}-", label))
        .tempfile()
        .map_err(|e| temp_error("failed to create temporary key file", e))?;
    file.write_all(contents)
        .and_then(|()| file.flush())
        .map_err(|e| temp_error("failed to write temporary key file", e))?;
    Ok(file.into_temp_path())
}

fn temp_error(msg: &str, err: io::Error) -> AgedropError {
    AgedropError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Io, msg, err)
}

fn key_read_error(path: &Path, err: io::Error) -> AgedropError {
    AgedropError::with_kind_and_source(
        ErrorCategory::User,
        ErrorKind::MissingKey,
        format!("failed to read key file {}", path.display()),
        err,
    )
}
