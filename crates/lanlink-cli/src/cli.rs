//! Clap CLI definitions for lanlink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  lanlink id                    Print this node's peer id
  lanlink run                   Join the LAN and chat from stdin

While running, type `<peer-id> <message>` to send (a unique id prefix is
enough) or `peers` to list known peers.";

/// lanlink: encrypted peer messaging on the local network.
#[derive(Parser)]
#[command(name = "lanlink", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the node id, creating the identity if needed.
    Id,
    /// Start the node: listener, discovery and an interactive prompt.
    Run,
}
