//! Purpose: `ringfile` CLI entry point and argument surface.
//! Role: Binary crate root; parses args, delegates to `commands`, exits with
//! a code derived from the error taxonomy.
//! Invariants: Ring data flows on stdout; logs and diagnostics go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bstr::ByteSlice;
use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use ringfile::api::{
    Error, ErrorKind, FileHeader, FileRing, FileRingOptions, SyncMode, Wait, to_exit_code,
};

mod commands;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(err.to_string().trim_end().to_string()));
            }
        },
    };

    commands::dispatch(cli.command)
}

#[derive(Parser)]
#[command(
    name = "ringfile",
    version,
    about = "Circular byte buffers in a single file",
    long_about = None,
    before_help = r#"Bytes live in a power-of-two ring that grows in place up to a limit;
the head is evicted explicitly, so the file doubles as a bounded
persistent log. A ring file is owned by one process at a time (exclusive
lock). The follow commands release the lock between polls, so feeding
and following from different terminals interleave."#,
    after_help = r#"EXAMPLES
  $ ringfile create events.ring --capacity 64K --limit 16M
  $ echo hello | ringfile feed events.ring
  $ ringfile drain events.ring
  $ ringfile info events.ring --json"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SyncModeCli {
    None,
    Sync,
    Force,
}

impl From<SyncModeCli> for SyncMode {
    fn from(value: SyncModeCli) -> Self {
        match value {
            SyncModeCli::None => SyncMode::None,
            SyncModeCli::Sync => SyncMode::Sync,
            SyncModeCli::Force => SyncMode::Force,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Create a new ring file",
        long_about = r#"Create an empty ring file.

Capacity is rounded up to a power of two. The ring grows in place up to
the limit when an append does not fit; a limit of 0 pins the capacity."#,
        after_help = r#"EXAMPLES
  $ ringfile create events.ring
  $ ringfile create events.ring --capacity 64K --limit 16M
  $ ringfile create wal.ring --sync force"#
    )]
    Create {
        #[arg(help = "Ring file to create", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(
            long,
            default_value = "128K",
            help = "Starting capacity; rounded up to a power of two"
        )]
        capacity: String,
        #[arg(
            long,
            default_value = "5M",
            help = "In-place growth limit; 0 pins the starting capacity"
        )]
        limit: String,
        #[arg(
            long,
            default_value = "none",
            value_enum,
            help = "Durability of header writes: none|sync|force"
        )]
        sync: SyncModeCli,
    },
    #[command(
        about = "Print a ring file's header without locking it",
        after_help = r#"EXAMPLES
  $ ringfile info events.ring
  $ ringfile info events.ring --json"#
    )]
    Info {
        #[arg(help = "Ring file to inspect", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Emit a JSON object instead of text")]
        json: bool,
    },
    #[command(
        about = "Append stdin (or an inline argument) to a ring",
        long_about = r#"Append bytes to a ring file.

Reads stdin to end, publishing chunk by chunk. An inline argument is
appended as one chunk with a trailing newline. The ring stays locked for
the duration of the feed; a feed that loses the lock race retries
briefly before giving up with a Busy error."#,
        after_help = r#"EXAMPLES
  $ journalctl -b | ringfile feed events.ring
  $ ringfile feed events.ring 'deploy finished'"#
    )]
    Feed {
        #[arg(help = "Ring file to append to", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(help = "Inline data; stdin is used when omitted")]
        data: Option<String>,
        #[arg(long, help = "Raise the growth limit for this feed (size, e.g. 64M)")]
        limit: Option<String>,
        #[arg(
            long,
            default_value = "none",
            value_enum,
            help = "Durability of header writes: none|sync|force"
        )]
        sync: SyncModeCli,
    },
    #[command(
        about = "Copy ring content to stdout and evict it",
        long_about = r#"Drain a ring file.

Copies buffered bytes to stdout and evicts them from the ring as they
are written out. Without --follow the command stops at the current end.
With --follow it polls for new data, releasing the file lock between
polls so a feeder in another terminal can get in."#,
        after_help = r#"EXAMPLES
  $ ringfile drain events.ring > consumed.bin
  $ ringfile drain events.ring --follow | grep ERROR"#
    )]
    Drain {
        #[arg(help = "Ring file to drain", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Keep waiting for new data until interrupted")]
        follow: bool,
    },
    #[command(
        about = "Tail a ring without consuming it",
        long_about = r#"Follow a ring non-destructively.

Prints everything buffered, then polls for new data and prints each
arriving chunk with a timestamp, evicting nothing. The file lock is
released between polls. Bytes are printed lossily; invalid UTF-8 is
replaced, not dropped. Stop with Ctrl-C."#,
        after_help = r#"EXAMPLES
  $ ringfile watch events.ring"#
    )]
    Watch {
        #[arg(help = "Ring file to watch", value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    #[command(
        about = "Shrink a ring file to fit its contents",
        long_about = r#"Reclaim disk space.

Rewrites the ring at the smallest power-of-two capacity that holds the
buffered bytes (and the --capacity floor, when given), then truncates
the file."#,
        after_help = r#"EXAMPLES
  $ ringfile shrink events.ring
  $ ringfile shrink events.ring --capacity 64K"#
    )]
    Shrink {
        #[arg(help = "Ring file to shrink", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Smallest capacity to keep (size, e.g. 64K)")]
        capacity: Option<String>,
    },
    #[command(
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ ringfile completions bash > ~/.local/share/bash-completion/completions/ringfile
  $ ringfile completions zsh > ~/.zfunc/_ringfile"#
    )]
    Completions {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {err}");
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Io\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(err.to_string()));
    let mut map = Map::new();
    map.insert("error".to_string(), Value::Object(inner));
    Value::Object(map)
}

fn parse_size(input: &str) -> Result<usize, Error> {
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or_else(|| trimmed.len());
    let digits = trimmed[..split].trim();
    let suffix = trimmed[split..].trim();

    let value: usize = digits.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!(
                "invalid size {trimmed:?}; use bytes or K/M/G (e.g. 64M)"
            ))
            .with_source(err)
    })?;

    let multiplier = match suffix {
        "" => 1,
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "invalid size suffix {suffix:?}; use K/M/G (e.g. 64M)"
            )));
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("size overflows this platform"))
}

fn format_system_time(time: SystemTime) -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = time.duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn format_bytes(value: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    if value < KIB {
        return value.to_string();
    }
    let (unit, suffix) = if value >= GIB {
        (GIB, "G")
    } else if value >= MIB {
        (MIB, "M")
    } else {
        (KIB, "K")
    };
    if value.is_multiple_of(unit) {
        return format!("{}{}", value / unit, suffix);
    }
    format!("{:.1}{}", (value as f64) / (unit as f64), suffix)
}
