//! agedrop CLI
//!
//! Command-line stand-in for a drop target: a `drop` invocation, or each
//! line read by `session`, is one drop gesture.

use clap::{ArgAction, Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use agedrop::config::{self, Config};
use agedrop::error::{AgedropError, ErrorCategory, ErrorKind, Result};
use agedrop::exec::SystemProbe;
use agedrop::outcome::{AwaitedKey, SessionResult};
use agedrop::session::Session;
use agedrop::settings::{JsonKeyStore, KeyStore};

#[derive(Parser)]
#[command(name = "agedrop")]
#[command(version)]
#[command(about = "Encrypt or decrypt files by dropping them with an age key.")]
#[command(long_about = None)]
struct Cli {
    /// Path to the age executable [default: next to agedrop, then PATH]
    #[arg(long = "age", global = true, env = "AGEDROP_AGE", value_name = "FILE")]
    age: Option<PathBuf>,

    /// Per-file time limit in seconds
    #[arg(
        long,
        global = true,
        env = "AGEDROP_TIMEOUT",
        value_name = "SECS",
        default_value_t = config::DEFAULT_TIMEOUT.as_secs()
    )]
    timeout: u64,

    /// Number of files processed concurrently
    #[arg(
        long,
        global = true,
        env = "AGEDROP_WORKERS",
        value_name = "N",
        default_value_t = config::DEFAULT_WORKERS
    )]
    workers: usize,

    /// Write binary instead of ASCII-armored ciphertext
    #[arg(long, global = true)]
    no_armor: bool,

    /// Settings file holding the remembered recipient key
    #[arg(long, global = true, env = "AGEDROP_SETTINGS", value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drop files, folders and key files in one gesture
    #[command(alias = "d")]
    Drop {
        /// Payloads, folders, recipient or identity key files
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Read drop gestures from stdin, one per line, paths separated by TAB
    #[command(alias = "s")]
    Session,

    /// Inspect or clear the remembered recipient key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Print the remembered recipient key file
    Show,
    /// Forget the remembered recipient key
    Forget,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e.detail());
            1
        }
    };
    process::exit(code);
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config {
        binary: cli.age.clone(),
        timeout: Duration::from_secs(cli.timeout),
        workers: cli.workers,
        armor: !cli.no_armor,
        settings_path: cli.settings.clone(),
        ..Config::default()
    };
    let store = JsonKeyStore::new(config.settings_path());

    match cli.command {
        Commands::Key {
            action: KeyAction::Show,
        } => {
            match store.load_recipient()? {
                Some(path) => println!("{}", path.display()),
                None => println!("no recipient key remembered"),
            }
            Ok(0)
        }
        Commands::Key {
            action: KeyAction::Forget,
        } => {
            store.save_recipient(None)?;
            println!("recipient key forgotten");
            Ok(0)
        }
        Commands::Drop { paths } => {
            let mut session = open_session(&config, store)?;
            let result = session.submit_drop(&paths);
            report(&result, cli.json)?;
            Ok(exit_code(&result))
        }
        Commands::Session => {
            let mut session = open_session(&config, store)?;
            let mut code = 0;
            for line in io::stdin().lock().lines() {
                let line = line.map_err(|e| {
                    AgedropError::with_kind_and_source(
                        ErrorCategory::Internal,
                        ErrorKind::Io,
                        "failed to read stdin",
                        e,
                    )
                })?;
                let paths: Vec<PathBuf> = line
                    .split('\t')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect();
                if paths.is_empty() {
                    continue;
                }
                let result = session.submit_drop(&paths);
                report(&result, cli.json)?;
                if result.has_failures() {
                    code = 1;
                }
            }
            if !session.pending().is_empty() {
                eprintln!(
                    "{} file(s) left unprocessed, no key was dropped",
                    session.pending().len()
                );
                code = 1;
            }
            Ok(code)
        }
    }
}

fn open_session(config: &Config, store: JsonKeyStore) -> Result<Session> {
    let probe = SystemProbe::new(config.binary.clone());
    Session::new(config, &probe, Box::new(store))
}

fn exit_code(result: &SessionResult) -> i32 {
    if result.has_failures() || result.awaiting.is_some() {
        1
    } else {
        0
    }
}

fn report(result: &SessionResult, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(result).map_err(|e| {
            AgedropError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to serialize result",
                e,
            )
        })?;
        println!("{}", text);
        return Ok(());
    }

    for outcome in &result.outcomes {
        match (&outcome.output, outcome.is_success()) {
            (Some(output), true) => {
                println!("ok    {} -> {}", outcome.input.display(), output.display())
            }
            _ => println!(
                "FAIL  {}: {}",
                outcome.input.display(),
                outcome.error_detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    if let Some(awaited) = result.awaiting {
        let key = match awaited {
            AwaitedKey::Recipient => "a recipient public key",
            AwaitedKey::Identity => "an identity private key",
        };
        println!(
            "{} file(s) waiting for {}; drop one to continue",
            result.pending, key
        );
    }
    if !result.outcomes.is_empty() {
        println!(
            "{} succeeded, {} failed",
            result.success_count, result.failure_count
        );
    }
    Ok(())
}
