//! CLI command implementations.
//!
//! Each submodule implements one burrow subcommand on top of
//! [`AppContext`](crate::context::AppContext).

pub mod exec;
pub mod files;
pub mod init;
pub mod provisioner;
pub mod sandbox;
pub mod task;

use clap::Args;

/// The thread whose sandbox a command operates on.
#[derive(Args, Debug, Clone)]
pub struct ThreadArg {
    /// Thread id
    #[arg(short, long = "thread", env = "BURROW_THREAD")]
    pub thread: String,
}
