//! Exposes the command line application.

use anyhow::{Context, Result};
use clap::Parser;

use blobmirror_service::Config;

use crate::logging;
use crate::server;

/// Blobmirror commands.
#[derive(Debug, Parser)]
#[command(name = "blobmirror", version)]
enum Command {
    /// Run the web server.
    Run,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let command = Command::parse();
    let config = Config::from_env().context("failed loading config")?;

    logging::init_logging(&config);

    match command {
        Command::Run => server::run(config).context("failed to start the server")?,
    }

    Ok(())
}
