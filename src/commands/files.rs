//! `burrow read|write|ls|replace`: file operations on a thread's sandbox,
//! addressed by virtual path (`/mnt/user-data/...`).

use anyhow::{bail, Result};
use clap::Subcommand;
use std::io::Read;

use super::ThreadArg;
use crate::context::AppContext;

/// File actions.
#[derive(Subcommand, Debug)]
pub enum FileAction {
    /// Print a file, optionally limited to a 1-indexed inclusive line range
    Read {
        #[command(flatten)]
        target: ThreadArg,

        path: String,

        #[arg(long)]
        start: Option<usize>,

        #[arg(long)]
        end: Option<usize>,
    },

    /// Write a file; content is read from stdin when omitted
    Write {
        #[command(flatten)]
        target: ThreadArg,

        path: String,

        content: Option<String>,

        /// Append instead of replacing
        #[arg(long)]
        append: bool,
    },

    /// List a directory two levels deep
    Ls {
        #[command(flatten)]
        target: ThreadArg,

        #[arg(default_value = "/mnt/user-data")]
        path: String,
    },

    /// Replace text in a file
    Replace {
        #[command(flatten)]
        target: ThreadArg,

        path: String,
        old: String,
        new: String,

        /// Replace every occurrence instead of exactly one
        #[arg(long)]
        all: bool,
    },
}

impl FileAction {
    fn thread(&self) -> &str {
        match self {
            Self::Read { target, .. }
            | Self::Write { target, .. }
            | Self::Ls { target, .. }
            | Self::Replace { target, .. } => &target.thread,
        }
    }
}

pub(crate) async fn run(ctx: &AppContext, action: FileAction) -> Result<()> {
    let tools = ctx.tools(action.thread()).await?;

    let output = match action {
        FileAction::Read {
            path, start, end, ..
        } => tools.read_file(&path, start, end).await,
        FileAction::Write {
            path,
            content,
            append,
            ..
        } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            tools.write_file(&path, &content, append).await
        }
        FileAction::Ls { path, .. } => tools.ls(&path).await,
        FileAction::Replace {
            path,
            old,
            new,
            all,
            ..
        } => tools.str_replace(&path, &old, &new, all).await,
    };

    print_tool_output(&output)
}

/// Tool results are plain strings; an `Error:` prefix marks a failure.
fn print_tool_output(output: &str) -> Result<()> {
    if let Some(message) = output.strip_prefix("Error: ") {
        bail!("{message}");
    }
    if output.ends_with('\n') {
        print!("{output}");
    } else {
        println!("{output}");
    }
    Ok(())
}
