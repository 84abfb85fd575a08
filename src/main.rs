//! Purpose: `altermesh` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs one session operation, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout (pretty on a TTY, compact otherwise).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`; lock timeouts map to 124.
//! Invariants: All segment access goes through `api::Session` (locks + mmap safety).
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod session_info_json;

use altermesh::api::{
    Error, ErrorKind, ExportMessage, GeometryRegistry, ImportBundle, ImportMessage, LockPolicy,
    ParamsMessage, Received, Session, SessionMessageExt, SessionOptions, SessionTokens, Side,
    to_exit_code,
};
use altermesh::segment_paths::resolve_segment_dir;
use session_info_json::session_info_json;

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
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `altermesh --help`."));
            }
        },
    };

    let context = CommandContext {
        dir: resolve_segment_dir(cli.dir.as_deref()),
        timeout: cli.timeout_ms.map(Duration::from_millis),
    };

    command_dispatch::dispatch_command(cli.command, &context)
        .map_err(add_attach_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "altermesh",
    version,
    about = "Shared-memory handoff between a DCC plugin and its orchestrator",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"One segment per session, named by two tokens. The host writes import
parameters, the plugin answers with exported geometry, strictly alternating.

Mental model:
  - `session create` makes the segment (host side)
  - `send-*` takes the write lock, writes one message, hands over
  - `recv-*` waits for the peer's message and hands the turn back
"#,
    after_help = r#"EXAMPLES
  $ altermesh session create {H} {P}
  $ altermesh send-import {H} {P} '{"Frame":10,"Params":[{"Id":"Scale","Type":"VALUE","Value":2.5}]}'
  $ altermesh recv-import {H} {P}          # plugin side
  $ altermesh session delete {H} {P}

LEARN MORE
  $ altermesh <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Segment directory (default: $ALTERMESH_SEGMENT_DIR, /dev/shm, or the temp dir)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long = "timeout-ms",
        global = true,
        help = "Give up waiting for a lock after this many milliseconds (exit 124)"
    )]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

struct CommandContext {
    dir: PathBuf,
    timeout: Option<Duration>,
}

#[derive(Args, Clone, Debug)]
struct TokenArgs {
    #[arg(help = "First session token (host order)")]
    first: String,
    #[arg(help = "Second session token")]
    second: String,
}

impl TokenArgs {
    fn tokens(&self) -> Result<SessionTokens, Error> {
        SessionTokens::new(self.first.as_str(), self.second.as_str())
    }
}

#[derive(Args, Clone, Debug)]
struct InputArgs {
    #[arg(help = "Inline JSON message")]
    data: Option<String>,
    #[arg(
        short = 'f',
        long = "file",
        help = "Read the JSON message from a file (use - for stdin)",
        conflicts_with = "data",
        value_hint = ValueHint::FilePath
    )]
    file: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SideCli {
    Host,
    Plugin,
}

impl From<SideCli> for Side {
    fn from(side: SideCli) -> Self {
        match side {
            SideCli::Host => Side::Host,
            SideCli::Plugin => Side::Plugin,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Create, inspect, free, or delete session segments",
        after_help = r#"EXAMPLES
  $ altermesh session create
  $ altermesh session create --size 16M {H} {P}
  $ altermesh session info {H} {P}
  $ altermesh session free --side plugin {H} {P}
  $ altermesh session delete {H} {P}"#
    )]
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    #[command(
        about = "Send an import message (host to plugin)",
        after_help = r#"EXAMPLES
  $ altermesh send-import {H} {P} '{"Object":"Cube","Frame":10,"Params":[]}'
  $ altermesh send-import {H} {P} -f params.json

NOTES
  - TEXTURE, MESH, and COLLECTION params need inline resources; use the library API."#
    )]
    SendImport {
        #[command(flatten)]
        tokens: TokenArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    #[command(about = "Receive an import message (plugin side)")]
    RecvImport {
        #[command(flatten)]
        tokens: TokenArgs,
    },
    #[command(about = "Send an export message (plugin to host)")]
    SendExport {
        #[command(flatten)]
        tokens: TokenArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    #[command(about = "Receive an export message (host side)")]
    RecvExport {
        #[command(flatten)]
        tokens: TokenArgs,
        #[arg(
            long,
            default_value_t = 0,
            help = "Attributes per mesh, as requested in the import message"
        )]
        attributes: usize,
    },
    #[command(about = "Send a params discovery message (plugin to host)")]
    SendParams {
        #[command(flatten)]
        tokens: TokenArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    #[command(about = "Receive a params discovery message (host side)")]
    RecvParams {
        #[command(flatten)]
        tokens: TokenArgs,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info")]
    Version,
}

#[derive(Subcommand)]
enum SessionCommand {
    #[command(
        about = "Create a session segment as the host",
        long_about = r#"Create the segment for a token pair and leave it in place for other processes.

Without tokens, a fresh pair of GUID tokens is generated."#
    )]
    Create {
        #[arg(help = "First token (generated when omitted)", requires = "second")]
        first: Option<String>,
        #[arg(help = "Second token")]
        second: Option<String>,
        #[arg(long, help = "Segment size including the header (bytes or K/M/G)")]
        size: Option<String>,
    },
    #[command(arg_required_else_help = true, about = "Show segment size, lock state, and sequence")]
    Info {
        #[command(flatten)]
        tokens: TokenArgs,
    },
    #[command(
        arg_required_else_help = true,
        about = "Mark the channel freed so a waiting peer stops"
    )]
    Free {
        #[command(flatten)]
        tokens: TokenArgs,
        #[arg(long, value_enum, default_value = "host", help = "Side releasing the channel")]
        side: SideCli,
    },
    #[command(
        arg_required_else_help = true,
        about = "Delete a segment and its wake semaphores"
    )]
    Delete {
        #[command(flatten)]
        tokens: TokenArgs,
    },
}

fn session_options(context: &CommandContext) -> SessionOptions {
    SessionOptions {
        lock: LockPolicy {
            timeout: context.timeout,
            ..LockPolicy::default()
        },
        ..SessionOptions::default()
    }
}

fn open_session(context: &CommandContext, tokens: &TokenArgs, side: Side) -> Result<Session, Error> {
    Session::open(&context.dir, tokens.tokens()?, side, session_options(context))
}

fn read_input(input: &InputArgs) -> Result<String, Error> {
    if let Some(data) = &input.data {
        return Ok(data.clone());
    }
    let from_stdin = match input.file.as_deref() {
        Some(path) if path != Path::new("-") => {
            return std::fs::read_to_string(path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read input file")
                    .with_path(path)
                    .with_source(err)
            });
        }
        Some(_) => true,
        None => !io::stdin().is_terminal(),
    };
    if !from_stdin {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("missing message")
            .with_hint("Pass inline JSON, use -f <file>, or pipe JSON on stdin."));
    }
    let mut text = String::new();
    io::stdin().read_to_string(&mut text).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read stdin")
            .with_source(err)
    })?;
    Ok(text)
}

fn parse_message<T: DeserializeOwned>(text: &str, what: &str) -> Result<T, Error> {
    serde_json::from_str(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid {what} JSON"))
            .with_hint(format!("line {} column {}", err.line(), err.column()))
            .with_source(err)
    })
}

fn import_bundle_from_json(text: &str) -> Result<ImportBundle, Error> {
    let message: ImportMessage = parse_message(text, "import message")?;
    if let Some(param) = message.params.iter().find(|param| param.value.has_resource()) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "param {:?} needs an inline resource, which the CLI cannot attach",
                param.id
            ))
            .with_hint("Send TEXTURE, MESH, and COLLECTION params through the library or C ABI."));
    }
    Ok(ImportBundle::new(message))
}

fn emit_sent(seq: Option<u64>, kind: &str) -> Result<RunOutcome, Error> {
    match seq {
        Some(seq) => {
            emit_json(json!({ "sent": kind, "seq": seq }));
            Ok(RunOutcome::ok())
        }
        None => Err(lock_timeout("write")),
    }
}

fn emit_received<T: serde::Serialize>(received: Received<T>) -> Result<RunOutcome, Error> {
    if received.is_timed_out() {
        return Err(lock_timeout("read"));
    }
    let value = serde_json::to_value(&received).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode received message")
            .with_source(err)
    })?;
    emit_json(value);
    Ok(RunOutcome::ok())
}

fn lock_timeout(what: &str) -> Error {
    Error::new(ErrorKind::Timeout)
        .with_message(format!("timed out waiting for the {what} lock"))
        .with_hint("Check that the peer process is running, or raise --timeout-ms.")
}

fn parse_size(input: &str) -> Result<u64, Error> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let value: u64 = digits.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid size")
            .with_hint("Use bytes or K/M/G (e.g. 128M).")
            .with_source(err)
    })?;
    let multiplier: u64 = match suffix.trim() {
        "" => 1,
        "K" | "k" => 1 << 10,
        "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("invalid size suffix")
                .with_hint("Use K/M/G (e.g. 128M)."));
        }
    };
    value.checked_mul(multiplier).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("size overflow")
            .with_hint("Use a smaller size value.")
    })
}

fn add_attach_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Attach || err.hint().is_some() {
        return err;
    }
    err.with_hint("No segment for these tokens. Run `altermesh session create` first, or check --dir.")
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("I/O error. Check the segment directory, permissions, and free space.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share the command if it persists.",
    )
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("altermesh {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "altermesh",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Attach => "segment not found",
        ErrorKind::AlreadyExists => "segment already exists",
        ErrorKind::Overflow => "message exceeds segment capacity",
        ErrorKind::Decode => "malformed message",
        ErrorKind::Corrupt => "corrupt message",
        ErrorKind::Timeout => "timed out",
        ErrorKind::Closed => "channel closed",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(seq) = err.seq() {
        inner.insert("seq".to_string(), json!(seq));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(seq) = err.seq() {
        lines.push(format!("seq: {seq}"));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
