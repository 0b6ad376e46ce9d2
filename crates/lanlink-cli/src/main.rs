//! lanlink CLI: run a secure LAN messaging node.

mod cli;
mod cmd;
mod config;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Id => cmd::id::cmd_id(config_path),
        Commands::Run => cmd::run::cmd_run(config_path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
