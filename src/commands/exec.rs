//! `burrow exec`: runs one shell command in a thread's sandbox.

use anyhow::{bail, Result};
use std::io::Write;
use std::process::ExitCode;
use tracing::debug;

use crate::context::AppContext;

pub(crate) async fn run(ctx: &AppContext, thread_id: &str, command: &[String]) -> Result<ExitCode> {
    if command.is_empty() {
        bail!("No command given");
    }
    // A single argument is taken as a full shell line.
    let line = if command.len() == 1 {
        command[0].clone()
    } else {
        shell_words::join(command)
    };

    let tools = ctx.tools(thread_id).await?;
    debug!(thread_id, command = %line, "exec");
    let output = tools.sandbox().execute_command(&line).await?;

    let mut stdout = std::io::stdout();
    stdout.write_all(output.stdout.as_bytes())?;
    stdout.flush()?;
    eprint!("{}", output.stderr);

    Ok(ExitCode::from(exit_status(output.exit_code)))
}

/// Maps a sandbox exit status onto a process exit status.
pub(crate) fn exit_status(code: i64) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
