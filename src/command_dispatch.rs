//! Purpose: Hold top-level CLI command dispatch for `altermesh`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command opens at most one session and releases it before returning.
//! Invariants: Helpers in `main.rs` remain the source of input parsing and output envelopes.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    context: &CommandContext,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "altermesh", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Session { command } => dispatch_session(command, context),
        Command::SendImport { tokens, input } => {
            let bundle = import_bundle_from_json(&read_input(&input)?)?;
            let mut session = open_session(context, &tokens, Side::Host)?;
            let seq = session.send_import(&bundle, &GeometryRegistry::default())?;
            emit_sent(seq, "import")
        }
        Command::RecvImport { tokens } => {
            let mut session = open_session(context, &tokens, Side::Plugin)?;
            emit_received(session.recv_import(&GeometryRegistry::default())?)
        }
        Command::SendExport { tokens, input } => {
            let message: ExportMessage = parse_message(&read_input(&input)?, "export message")?;
            let mut session = open_session(context, &tokens, Side::Plugin)?;
            let seq = session.send_export(&message)?;
            emit_sent(seq, "export")
        }
        Command::RecvExport { tokens, attributes } => {
            let mut session = open_session(context, &tokens, Side::Host)?;
            emit_received(session.recv_export(attributes)?)
        }
        Command::SendParams { tokens, input } => {
            let message: ParamsMessage = parse_message(&read_input(&input)?, "params message")?;
            let mut session = open_session(context, &tokens, Side::Plugin)?;
            let seq = session.send_params(&message, &GeometryRegistry::default())?;
            emit_sent(seq, "params")
        }
        Command::RecvParams { tokens } => {
            let mut session = open_session(context, &tokens, Side::Host)?;
            emit_received(session.recv_params(&GeometryRegistry::default())?)
        }
    }
}

fn dispatch_session(command: SessionCommand, context: &CommandContext) -> Result<RunOutcome, Error> {
    match command {
        SessionCommand::Create {
            first,
            second,
            size,
        } => {
            let tokens = match (first, second) {
                (Some(first), Some(second)) => SessionTokens::new(first, second)?,
                _ => SessionTokens::generate()?,
            };
            let mut options = session_options(context);
            if let Some(size) = size {
                options.segment_size = parse_size(&size)?;
            }
            std::fs::create_dir_all(&context.dir).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to create segment directory")
                    .with_path(&context.dir)
                    .with_source(err)
            })?;
            let mut session = Session::create(&context.dir, tokens, options)?;
            let mut value = session_info_json(&session.info()?);
            session.disown();
            if let Value::Object(map) = &mut value {
                map.insert(
                    "plugin_args".to_string(),
                    json!(session.tokens().plugin_args()),
                );
            }
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        SessionCommand::Info { tokens } => {
            let session = open_session(context, &tokens, Side::Host)?;
            emit_json(session_info_json(&session.info()?));
            Ok(RunOutcome::ok())
        }
        SessionCommand::Free { tokens, side } => {
            let mut session = open_session(context, &tokens, side.into())?;
            let path = session.path().display().to_string();
            session.free()?;
            emit_json(json!({ "freed": path }));
            Ok(RunOutcome::ok())
        }
        SessionCommand::Delete { tokens } => {
            let tokens = tokens.tokens()?;
            let deleted = Session::destroy(&context.dir, &tokens)?;
            let path = context.dir.join(tokens.segment_name());
            emit_json(json!({
                "path": path.display().to_string(),
                "deleted": deleted,
            }));
            Ok(RunOutcome::ok())
        }
    }
}
