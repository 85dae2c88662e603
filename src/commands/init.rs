//! `burrow init`: writes a commented `burrow.toml` into the current directory.
//!
//! The filesystem is reached only through closures so the decision logic
//! runs in tests without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    info!(dir = %cwd.display(), "Initializing burrow");

    let outcome = write_config(
        Path::new(CONFIG_FILE),
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_outcome(Path::new(CONFIG_FILE), outcome));
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Overwritten,
    Skipped,
}

fn write_config<E, W>(path: &Path, force: bool, exists: E, mut write: W) -> Result<Outcome>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let existed = exists(path);
    if existed && !force {
        return Ok(Outcome::Skipped);
    }
    write(path, templates::BURROW_TOML)?;
    Ok(if existed {
        Outcome::Overwritten
    } else {
        Outcome::Created
    })
}

fn format_outcome(path: &Path, outcome: Outcome) -> String {
    let mut out = String::new();
    let name = path.display().to_string();

    match outcome {
        Outcome::Created => {
            let _ = writeln!(out, "\n{} Created {}\n", "✓".green().bold(), name.cyan());
        }
        Outcome::Overwritten => {
            let _ = writeln!(out, "\n{} Overwrote {}\n", "↻".blue(), name.cyan());
        }
        Outcome::Skipped => {
            let _ = writeln!(
                out,
                "\n{} {} already exists, use --force to overwrite",
                "⊘".yellow(),
                name
            );
            return out;
        }
    }

    let _ = writeln!(out, "{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Pick a backend under {} in {}",
        "[sandbox]".cyan(),
        name.cyan()
    );
    let _ = writeln!(
        out,
        "  2. Run {} to check it works",
        "burrow exec --thread demo -- echo hello".green()
    );
    let _ = writeln!(
        out,
        "  3. Run {} to delegate a task",
        "burrow task --thread demo --type bash 'ls /mnt/user-data'".green()
    );
    out
}
